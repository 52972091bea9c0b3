use crate::errors::Result;
use broker::routing::SensorLog;
use broker::AckType;
use chrono::SecondsFormat;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Appends forwarded device log records to one shared file.
#[derive(Debug, Clone)]
pub struct LogFileWriter {
    path: PathBuf,
}

impl LogFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, log: &SensorLog) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format_line(log).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub fn format_line(log: &SensorLog) -> String {
    format!(
        "{} {} ({}): {}\n",
        log.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        log.serial_number,
        log.level,
        log.message
    )
}

pub async fn handle_log(writer: &LogFileWriter, log: SensorLog) -> AckType {
    match writer.append(&log).await {
        Ok(()) => AckType::Ack,
        Err(e) => {
            error!(
                serial = %log.serial_number,
                "Failed to write device log to {}: {}",
                writer.path().display(),
                e
            );
            AckType::NackRequeue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::routing::LogLevel;
    use chrono::{TimeZone, Utc};

    fn log(message: &str, level: LogLevel) -> SensorLog {
        SensorLog {
            serial_number: "dev-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            level,
            message: message.to_string(),
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("sensor-logs-{}.log", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line(&log("Sensor started", LogLevel::Info)),
            "2024-03-01T12:30:00.000Z dev-1 (INFO): Sensor started\n"
        );
    }

    #[tokio::test]
    async fn test_lines_appended_in_order() {
        let path = temp_path();
        let writer = LogFileWriter::new(&path);

        assert_eq!(
            handle_log(&writer, log("first", LogLevel::Info)).await,
            AckType::Ack
        );
        assert_eq!(
            handle_log(&writer, log("second", LogLevel::Warning)).await,
            AckType::Ack
        );

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("dev-1 (INFO): first"));
        assert!(lines[1].ends_with("dev-1 (WARNING): second"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_unwritable_path_requeues() {
        let writer = LogFileWriter::new(temp_path().join("missing-dir").join("iot.log"));

        assert_eq!(
            handle_log(&writer, log("lost", LogLevel::Error)).await,
            AckType::NackRequeue
        );
    }
}
