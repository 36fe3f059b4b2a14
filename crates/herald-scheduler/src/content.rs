//! Content resolution and template rendering.
//!
//! A [`ContentResolver`] turns a template plus schedule into a JSON data
//! object; a [`TemplateRenderer`] substitutes that data into the template's
//! subject and bodies. [`SectionResolver`] and [`TeraRenderer`] are the
//! stock implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, SecondsFormat, Utc};
use futures_util::future::join_all;
use herald_core::{ContentTemplate, Schedule, TemplateConfig, TimeFrameUnit};
use serde_json::{Map, Value};
use tera::{Context, Tera};
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};

pub const DEFAULT_TIME_FRAME: u32 = 7;

#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Build the data object the template is rendered against.
    async fn resolve(
        &self,
        template: &ContentTemplate,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<Value>;
}

pub trait TemplateRenderer: Send + Sync {
    /// Render a plain-text part (subject, text body).
    fn render_text(&self, source: &str, content: &Value) -> Result<String>;

    /// Render an HTML part; substituted values are escaped.
    fn render_html(&self, source: &str, content: &Value) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Section-based resolver
// ---------------------------------------------------------------------------

/// Input handed to every [`ContentSection`].
#[derive(Debug, Clone, Copy)]
pub struct SectionRequest<'a> {
    pub schedule: &'a Schedule,
    pub template: &'a ContentTemplate,
    /// The schedule's config, falling back to the template default.
    pub config: Option<&'a TemplateConfig>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl SectionRequest<'_> {
    pub fn max_items(&self) -> Option<u32> {
        self.config.and_then(|c| c.max_items)
    }
}

/// One named block of data inside a content type (e.g. "top_posts").
#[async_trait]
pub trait ContentSection: Send + Sync {
    /// Key under which the section's value appears in the content object.
    fn name(&self) -> &str;

    /// A mandatory section failing fails the whole resolution; optional
    /// sections are dropped with a warning.
    fn mandatory(&self) -> bool {
        false
    }

    async fn fetch(&self, request: &SectionRequest<'_>) -> Result<Value>;
}

/// Resolves content by running the sections registered for the template's
/// content type and merging them over a common base object.
///
/// Base keys: `generated_at`, `date_range_start`, `date_range_end`,
/// `date_range_display`, `schedule_name`, `template_name`, `server_name`,
/// `server_url`.
#[derive(Default, Clone)]
pub struct SectionResolver {
    types: HashMap<String, Vec<Arc<dyn ContentSection>>>,
    server_name: String,
    server_url: String,
}

impl SectionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name and link of the sending server, exposed to every template.
    pub fn with_server(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.server_name = name.into();
        self.server_url = url.into();
        self
    }

    /// Declare a content type that renders from the base data alone.
    pub fn register_type(&mut self, content_type: impl Into<String>) {
        self.types.entry(content_type.into()).or_default();
    }

    /// Add a section to a content type, declaring the type if needed.
    pub fn register(&mut self, content_type: impl Into<String>, section: Arc<dyn ContentSection>) {
        self.types.entry(content_type.into()).or_default().push(section);
    }

    pub fn content_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ContentResolver for SectionResolver {
    async fn resolve(
        &self,
        template: &ContentTemplate,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        let sections = self.types.get(&template.content_type).ok_or_else(|| {
            SchedulerError::Content(format!(
                "unsupported content type: {}",
                template.content_type
            ))
        })?;

        let config = schedule.config.as_ref().or(template.default_config.as_ref());
        let (range_start, range_end) = date_range(config, now);
        let request = SectionRequest {
            schedule,
            template,
            config,
            range_start,
            range_end,
            now,
        };

        let mut data = base_data(&request);
        data.insert("server_name".into(), Value::String(self.server_name.clone()));
        data.insert("server_url".into(), Value::String(self.server_url.clone()));
        let fetched = join_all(sections.iter().map(|s| s.fetch(&request))).await;
        for (section, result) in sections.iter().zip(fetched) {
            match result {
                Ok(value) => {
                    data.insert(section.name().to_string(), value);
                }
                Err(e) if section.mandatory() => {
                    return Err(SchedulerError::Content(format!(
                        "section {} failed: {e}",
                        section.name()
                    )));
                }
                Err(e) => {
                    warn!(
                        schedule_id = %schedule.id,
                        section = section.name(),
                        error = %e,
                        "optional content section failed, omitting"
                    );
                }
            }
        }

        debug!(schedule_id = %schedule.id, content_type = %template.content_type, keys = data.len(), "content resolved");
        Ok(Value::Object(data))
    }
}

fn base_data(req: &SectionRequest<'_>) -> Map<String, Value> {
    let mut data = Map::new();
    let rfc = |dt: DateTime<Utc>| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true));
    data.insert("generated_at".into(), rfc(req.now));
    data.insert("date_range_start".into(), rfc(req.range_start));
    data.insert("date_range_end".into(), rfc(req.range_end));
    data.insert(
        "date_range_display".into(),
        Value::String(format_date_range(req.range_start, req.range_end)),
    );
    data.insert("schedule_name".into(), Value::String(req.schedule.name.clone()));
    data.insert("template_name".into(), Value::String(req.template.name.clone()));
    data
}

/// The reporting window ending at `now`.
///
/// Defaults to the last 7 days; a zero `time_frame` also means 7.
pub fn date_range(config: Option<&TemplateConfig>, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let frame = config
        .and_then(|c| c.time_frame)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_TIME_FRAME);
    let unit = config
        .and_then(|c| c.time_frame_unit)
        .unwrap_or(TimeFrameUnit::Days);

    let start = match unit {
        TimeFrameUnit::Hours => now - Duration::hours(i64::from(frame)),
        TimeFrameUnit::Days => now - Duration::days(i64::from(frame)),
        TimeFrameUnit::Weeks => now - Duration::days(i64::from(frame) * 7),
        TimeFrameUnit::Months => now
            .checked_sub_months(Months::new(frame))
            .unwrap_or(now - Duration::days(i64::from(frame) * 30)),
    };
    (start, now)
}

/// Human-readable window, collapsing the shared month and year:
/// `January 1 - 7, 2024`, `Jan 1 - Feb 7, 2024`, `Dec 28, 2023 - Jan 3, 2024`.
pub fn format_date_range(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    if start.year() == end.year() && start.month() == end.month() {
        format!(
            "{} {} - {}, {}",
            start.format("%B"),
            start.day(),
            end.day(),
            end.year()
        )
    } else if start.year() == end.year() {
        format!(
            "{} - {}, {}",
            start.format("%b %-d"),
            end.format("%b %-d"),
            end.year()
        )
    } else {
        format!("{} - {}", start.format("%b %-d, %Y"), end.format("%b %-d, %Y"))
    }
}

// ---------------------------------------------------------------------------
// Tera renderer
// ---------------------------------------------------------------------------

const HTML_PART: &str = "part.html";
const TEXT_PART: &str = "part.txt";

/// Renders template parts with [`tera`].
///
/// HTML parts are autoescaped, subject and text parts are not. On top of
/// tera's built-ins (`length`, `truncate`, `date`, `default`, ...) templates
/// get the `format_number`, `format_hours`, `format_duration`,
/// `format_percent` and `truncate_words` filters and a
/// `format_date_range(start=, end=)` function.
#[derive(Debug, Default, Clone, Copy)]
pub struct TeraRenderer;

impl TeraRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Parse `source` without rendering it.
    pub fn validate(&self, source: &str) -> Result<()> {
        engine().add_raw_template(TEXT_PART, source).map_err(render_error)
    }

    fn render(&self, name: &str, source: &str, content: &Value) -> Result<String> {
        let mut tera = engine();
        tera.add_raw_template(name, source).map_err(render_error)?;
        let context = Context::from_value(content.clone()).map_err(render_error)?;
        tera.render(name, &context).map_err(render_error)
    }
}

impl TemplateRenderer for TeraRenderer {
    fn render_text(&self, source: &str, content: &Value) -> Result<String> {
        self.render(TEXT_PART, source, content)
    }

    fn render_html(&self, source: &str, content: &Value) -> Result<String> {
        self.render(HTML_PART, source, content)
    }
}

fn engine() -> Tera {
    let mut tera = Tera::default();
    tera.autoescape_on(vec![".html"]);
    tera.register_filter("format_number", format_number);
    tera.register_filter("format_hours", format_hours);
    tera.register_filter("format_duration", format_duration);
    tera.register_filter("format_percent", format_percent);
    tera.register_filter("truncate_words", truncate_words);
    tera.register_function("format_date_range", date_range_function);
    tera
}

/// Flatten tera's error chain; the top-level message alone only names the
/// template.
fn render_error(e: tera::Error) -> SchedulerError {
    let mut message = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    SchedulerError::Render(message)
}

fn number(value: &Value, filter: &str) -> tera::Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| tera::Error::msg(format!("{filter} expects a number, got {value}")))
}

/// `1234567` -> `1,234,567`
fn format_number(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let n = match value.as_i64() {
        Some(n) => n,
        None => number(value, "format_number")?.round() as i64,
    };
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    Ok(Value::String(out))
}

/// Fractional hours: `0.5` -> `30 min`, `2.5` -> `2 hr 30 min`.
fn format_hours(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let hours = number(value, "format_hours")?;
    let text = if hours < 1.0 {
        format!("{} min", (hours * 60.0) as i64)
    } else {
        let h = hours as i64;
        let m = ((hours - h as f64) * 60.0) as i64;
        if m > 0 {
            format!("{h} hr {m} min")
        } else {
            format!("{h} hr")
        }
    };
    Ok(Value::String(text))
}

/// Whole minutes: `45` -> `45 min`, `90` -> `1h 30m`.
fn format_duration(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let minutes = number(value, "format_duration")? as i64;
    let text = match (minutes / 60, minutes % 60) {
        (0, m) => format!("{m} min"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    };
    Ok(Value::String(text))
}

fn format_percent(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let pct = number(value, "format_percent")?;
    let precision = args.get("precision").and_then(Value::as_u64).unwrap_or(1) as usize;
    Ok(Value::String(format!("{pct:.precision$}%")))
}

fn truncate_words(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("truncate_words expects a string"))?;
    let max = args
        .get("words")
        .and_then(Value::as_u64)
        .ok_or_else(|| tera::Error::msg("truncate_words requires a `words` argument"))? as usize;
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max {
        return Ok(Value::String(text.to_string()));
    }
    Ok(Value::String(format!("{}...", words[..max].join(" "))))
}

fn date_range_function(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let bound = |key: &str| -> tera::Result<DateTime<Utc>> {
        let raw = args
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| tera::Error::msg(format!("format_date_range requires `{key}`")))?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| tera::Error::msg(format!("format_date_range: bad {key} {raw:?}: {e}")))
    };
    Ok(Value::String(format_date_range(bound("start")?, bound("end")?)))
}
