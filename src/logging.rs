use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

pub struct CustomLogger {
    targets: Vec<LogTarget>,
    default_level: LevelFilter,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let format = config.format.unwrap_or_default();
        let default_level = config.level.unwrap_or_default().to_level_filter();
        let targets = config.targets.unwrap_or_default();

        let mut writers = Vec::with_capacity(targets.len());
        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or("File output type requires path")?;
                    Box::new(OpenOptions::new().create(true).append(true).open(path)?)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            targets,
            default_level,
            format,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn target_level(&self, target: &LogTarget) -> LevelFilter {
        target
            .level
            .as_ref()
            .map(LogLevel::to_level_filter)
            .unwrap_or(self.default_level)
    }

    fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|target| self.target_level(target))
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        json_line(record)
    }
}

fn json_line(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "line": record.line().unwrap_or(0),
        "message": record.args().to_string(),
    });
    entry.to_string()
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if record.level() <= self.target_level(target) {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

/// env_logger setup used when no logging section is configured.
/// `RUST_LOG` still overrides `log_level`.
pub fn init_fallback(log_level: Option<&str>, log_format: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let level = log_level.unwrap_or("info");
    let format = parse_log_format(log_format.unwrap_or("text"))?;

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }
    builder.try_init()?;

    Ok(())
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s).into()),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_log_level("WARN").unwrap(), LogLevel::Warn);
        assert!(parse_log_level("loud").is_err());
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert!(parse_log_format("xml").is_err());
    }

    #[test]
    fn test_file_target_respects_its_level() {
        let file = NamedTempFile::new().unwrap();
        let config = LoggingConfig {
            level: Some(LogLevel::Debug),
            format: Some(LogFormat::Json),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: Some(file.path().to_path_buf()),
                level: Some(LogLevel::Warn),
            }]),
        };
        let logger = CustomLogger::new(config).unwrap();

        for (level, message) in [(log::Level::Info, "quiet"), (log::Level::Error, "loud")] {
            logger.log(
                &Record::builder()
                    .level(level)
                    .target("path_proxy")
                    .args(format_args!("{}", message))
                    .build(),
            );
        }
        logger.flush();

        let written = std::fs::read_to_string(file.path()).unwrap();
        assert!(written.contains("\"message\":\"loud\""));
        assert!(!written.contains("quiet"));
    }

    #[test]
    fn test_file_target_requires_path() {
        let config = LoggingConfig {
            level: None,
            format: None,
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: None,
                level: None,
            }]),
        };
        assert!(CustomLogger::new(config).is_err());
    }
}
