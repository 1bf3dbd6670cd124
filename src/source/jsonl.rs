use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::error::SkipReason;
use crate::schema::ExtractedEvent;

use super::adapter::EventSource;

/// Replays events from a newline-delimited JSON file.
///
/// Each non-empty line is one `ExtractedEvent`. A line that does not
/// parse skips that event only; an I/O error ends the replay.
pub struct JsonlSource {
    path: String,
    lines: Lines<BufReader<File>>,
    line_no: u64,
}

impl JsonlSource {
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot open event file {}: {}", path, e))?;

        Ok(Self {
            path: path.to_string(),
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

#[async_trait::async_trait]
impl EventSource for JsonlSource {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn next_event(&mut self) -> Option<Result<ExtractedEvent, SkipReason>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    log::error!("reading {} failed at line {}: {}", self.path, self.line_no, e);
                    return None;
                }
            };
            self.line_no += 1;

            if line.trim().is_empty() {
                continue;
            }

            return Some(serde_json::from_str(&line).map_err(|e| {
                SkipReason::Malformed(format!("{}:{}: {}", self.path, self.line_no, e))
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bad_lines_skip_one_event() {
        let path = std::env::temp_dir().join(format!("smalldata-jsonl-{}.jsonl", std::process::id()));
        let body = concat!(
            r#"{"event_time": {"seconds": 1, "nanoseconds": 0}, "fields": {"gas": 1.0}}"#,
            "\n\n",
            "{broken\n",
            r#"{"event_time": {"seconds": 2, "nanoseconds": 0}, "run_id": 4}"#,
            "\n",
        );
        tokio::fs::write(&path, body).await.unwrap();

        let mut source = JsonlSource::open(path.to_str().unwrap()).await.unwrap();

        assert!(matches!(source.next_event().await, Some(Ok(_))));
        assert!(matches!(
            source.next_event().await,
            Some(Err(SkipReason::Malformed(_)))
        ));
        let last = source.next_event().await.unwrap().unwrap();
        assert_eq!(last.run_id, Some(4));
        assert!(source.next_event().await.is_none());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_file_fails_to_open() {
        assert!(JsonlSource::open("/definitely/not/here.jsonl").await.is_err());
    }
}
