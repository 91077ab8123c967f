//! Engine のストリーミングレスポンス処理
//!
//! build / push のレスポンスボディは `\r` 区切りの JSON レコード列で、
//! HTTP ステータスが 200 でもレコード内にエラーが埋め込まれることがあります。
//! レコードを 1 件ずつ読み、ログを蓄積しつつ終端エラーを検出します。

use crate::error::{BuildError, BuildResult, Step};
use crate::progress::BuildProgress;
use bollard::models::{ErrorDetail, ProgressDetail};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// 1 レコードの最大長
pub const MAX_RECORD_LEN: usize = 8 * 1024 * 1024;

/// build レスポンスのレコード
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default)]
    pub stream: Option<String>,
}

/// push レスポンスのレコード
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRecord {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
}

/// 分類済みのレコード
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressRecord {
    /// 通常のログ行
    Log(String),
    /// ID 付きのステップ（レイヤーごとの push 進捗など）
    Step {
        id: String,
        progress: Option<String>,
        status: Option<String>,
        stream: Option<String>,
    },
    /// ステータス行
    Status {
        progress: Option<String>,
        status: String,
        stream: Option<String>,
    },
    /// 終端エラー
    Error(String),
    /// テキストを持たないレコード（`aux` のみなど）
    Empty,
}

impl ProgressRecord {
    /// ログに追記する（id, progress, status, stream の順）
    pub fn append_to(&self, log: &mut String) {
        match self {
            ProgressRecord::Log(text) | ProgressRecord::Error(text) => log.push_str(text),
            ProgressRecord::Step {
                id,
                progress,
                status,
                stream,
            } => {
                log.push_str(id);
                for text in [progress, status, stream].into_iter().flatten() {
                    log.push_str(text);
                }
            }
            ProgressRecord::Status {
                progress,
                status,
                stream,
            } => {
                if let Some(progress) = progress {
                    log.push_str(progress);
                }
                log.push_str(status);
                if let Some(stream) = stream {
                    log.push_str(stream);
                }
            }
            ProgressRecord::Empty => {}
        }
    }

    /// スピナーに表示する 1 行
    fn summary(&self) -> Option<String> {
        let line = match self {
            ProgressRecord::Log(text) => text.trim().to_string(),
            ProgressRecord::Step {
                id,
                progress,
                status,
                ..
            } => format!(
                "{}: {} {}",
                id,
                status.as_deref().unwrap_or(""),
                progress.as_deref().unwrap_or("")
            )
            .trim()
            .to_string(),
            ProgressRecord::Status { status, .. } => status.trim().to_string(),
            ProgressRecord::Error(_) | ProgressRecord::Empty => return None,
        };
        (!line.is_empty()).then_some(line)
    }
}

/// レスポンスのレコード形状
pub trait StreamRecord: DeserializeOwned {
    fn classify(self) -> ProgressRecord;
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// `errorDetail.message` を優先し、空なら `error` を使う
fn embedded_error(detail: Option<ErrorDetail>, error: Option<String>) -> Option<String> {
    non_empty(detail.and_then(|d| d.message)).or_else(|| non_empty(error))
}

impl StreamRecord for BuildRecord {
    fn classify(self) -> ProgressRecord {
        if let Some(message) = embedded_error(self.error_detail, self.error) {
            return ProgressRecord::Error(message);
        }
        match non_empty(self.stream) {
            Some(stream) => ProgressRecord::Log(stream),
            None => ProgressRecord::Empty,
        }
    }
}

impl StreamRecord for PushRecord {
    fn classify(self) -> ProgressRecord {
        if let Some(message) = embedded_error(self.error_detail, self.error) {
            return ProgressRecord::Error(message);
        }

        let progress = non_empty(self.progress);
        let status = non_empty(self.status);
        let stream = non_empty(self.stream);

        if let Some(id) = non_empty(self.id) {
            return ProgressRecord::Step {
                id,
                progress,
                status,
                stream,
            };
        }

        match (progress, status, stream) {
            (progress, Some(status), stream) => ProgressRecord::Status {
                progress,
                status,
                stream,
            },
            (None, None, Some(stream)) => ProgressRecord::Log(stream),
            (Some(progress), None, stream) => {
                ProgressRecord::Log(progress + stream.as_deref().unwrap_or(""))
            }
            (None, None, None) => ProgressRecord::Empty,
        }
    }
}

/// ストリーム 1 本を読み終えた結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedOutcome {
    /// 全レコードのテキストを到着順に連結したもの
    pub log: String,
    /// 終端エラーのメッセージ
    pub error: Option<String>,
}

impl AggregatedOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
enum FrameError {
    Oversized(usize),
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// `\r` 区切りのフレームデコーダ
///
/// 前後の空白を取り除き、空のフレームは読み飛ばす。
#[derive(Debug, Default)]
struct RecordDecoder {
    next_index: usize,
}

impl Decoder for RecordDecoder {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\r') else {
                self.next_index = src.len();
                if src.len() > MAX_RECORD_LEN {
                    return Err(FrameError::Oversized(src.len()));
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let frame = src.split_to(end + 1);
            let record = frame[..end].trim_ascii();
            if !record.is_empty() {
                return Ok(Some(Bytes::copy_from_slice(record)));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        // 終端の `\r` がない最後のレコード
        let rest = src.split();
        self.next_index = 0;
        let record = rest.trim_ascii();
        if record.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Bytes::copy_from_slice(record)))
        }
    }
}

/// レスポンスボディを読み取ってログを集約する
pub struct StreamAggregator {
    step: Step,
    read_timeout: Option<Duration>,
    progress: Option<BuildProgress>,
}

impl StreamAggregator {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            read_timeout: None,
            progress: None,
        }
    }

    /// 1 回の読み取りの待ち時間の上限
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_progress(mut self, progress: BuildProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// ボディの終端、または終端エラーのレコードまで読み進める
    ///
    /// 終端エラーや壊れたレコードの後の残りのボディは解釈せずに読み捨てる
    /// （同じ接続で次のリクエストを送れるようにするため）。
    pub async fn aggregate<R, S>(&self, body: S) -> BuildResult<AggregatedOutcome>
    where
        R: StreamRecord,
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let mut frames = FramedRead::new(StreamReader::new(body), RecordDecoder::default());
        let mut outcome = AggregatedOutcome::default();
        let mut records = 0usize;

        let result = loop {
            let next = match self.read_timeout {
                Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
                    Ok(next) => next,
                    Err(_) => break Err(BuildError::Timeout { step: self.step }),
                },
                None => frames.next().await,
            };

            let frame = match next {
                None => break Ok(()),
                Some(Ok(frame)) => frame,
                Some(Err(FrameError::Io(e))) => break Err(BuildError::Io(e)),
                Some(Err(FrameError::Oversized(len))) => {
                    break Err(BuildError::StreamCorrupt {
                        step: self.step,
                        message: format!("record exceeds {} bytes ({} buffered)", MAX_RECORD_LEN, len),
                    });
                }
            };

            let record = match serde_json::from_slice::<R>(&frame) {
                Ok(record) => record.classify(),
                Err(e) => {
                    break Err(BuildError::StreamCorrupt {
                        step: self.step,
                        message: format!(
                            "{} in record {:?}",
                            e,
                            String::from_utf8_lossy(&frame[..frame.len().min(200)])
                        ),
                    });
                }
            };
            records += 1;
            tracing::trace!("{} record: {:?}", self.step, record);

            record.append_to(&mut outcome.log);
            if let ProgressRecord::Error(message) = &record {
                outcome.error = Some(message.clone());
                break Ok(());
            }

            if let Some(progress) = &self.progress {
                progress.record(record.summary().as_deref());
            }
        };

        let stopped_early =
            outcome.error.is_some() || matches!(result, Err(BuildError::StreamCorrupt { .. }));
        if stopped_early {
            self.drain(frames).await;
        }

        tracing::debug!("{} stream finished after {} records", self.step, records);

        if let Some(progress) = &self.progress {
            match (&result, &outcome.error) {
                (Ok(()), None) => progress.finish_success(),
                (Ok(()), Some(message)) => progress.finish_error(message),
                (Err(e), _) => progress.finish_error(&e.to_string()),
            }
        }

        result.map(|()| outcome)
    }

    /// 残りのボディを読み捨てる
    async fn drain<S>(&self, frames: FramedRead<StreamReader<S, Bytes>, RecordDecoder>)
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let mut reader = frames.into_inner();
        let mut sink = tokio::io::sink();
        let copy = tokio::io::copy(&mut reader, &mut sink);
        let drained = match self.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, copy).await {
                Ok(drained) => drained,
                Err(_) => {
                    tracing::debug!("Timed out draining the {} stream", self.step);
                    return;
                }
            },
            None => copy.await,
        };

        match drained {
            Ok(bytes) => tracing::debug!("Discarded {} trailing bytes of the {} stream", bytes, self.step),
            Err(e) => tracing::debug!("Failed to drain the {} stream: {}", self.step, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn body(chunks: &[&str]) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
        let chunks: Vec<std::io::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        stream::iter(chunks)
    }

    async fn build(chunks: &[&str]) -> BuildResult<AggregatedOutcome> {
        StreamAggregator::new(Step::Build)
            .aggregate::<BuildRecord, _>(body(chunks))
            .await
    }

    async fn push(chunks: &[&str]) -> BuildResult<AggregatedOutcome> {
        StreamAggregator::new(Step::Push)
            .aggregate::<PushRecord, _>(body(chunks))
            .await
    }

    #[tokio::test]
    async fn test_stream_records_are_concatenated() {
        let outcome = build(&["{\"stream\":\"a\"}\r{\"stream\":\"b\"}\r"]).await.unwrap();
        assert_eq!(outcome.log, "ab");
        assert_eq!(outcome.error, None);
    }

    #[tokio::test]
    async fn test_records_split_across_chunks() {
        let outcome = build(&["{\"stre", "am\":\"Step 1\\n\"}\r\n{\"str", "eam\":\"done\\n\"}\r\n"])
            .await
            .unwrap();
        assert_eq!(outcome.log, "Step 1\ndone\n");
    }

    #[tokio::test]
    async fn test_terminal_error_stops_processing() {
        let outcome = build(&[
            "{\"stream\":\"Step 1\\n\"}\r",
            "{\"errorDetail\":{\"message\":\"boom\"},\"error\":\"boom\"}\r",
            "{\"stream\":\"never\"}\r",
        ])
        .await
        .unwrap();

        assert_eq!(outcome.error.as_deref(), Some("boom"));
        assert!(outcome.log.contains("boom"));
        assert!(!outcome.log.contains("never"));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_error_detail_only() {
        let outcome = build(&["{\"errorDetail\":{\"message\":\"boom\"}}\r"]).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("boom"));
        assert_eq!(outcome.log, "boom");
    }

    #[tokio::test]
    async fn test_top_level_error_fallback() {
        let outcome = build(&["{\"error\":\"denied\",\"errorDetail\":{}}\r"]).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("denied"));
    }

    #[tokio::test]
    async fn test_trailing_record_without_delimiter() {
        let outcome = build(&["{\"stream\":\"a\"}\r{\"stream\":\"b\"}"]).await.unwrap();
        assert_eq!(outcome.log, "ab");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let outcome = build(&[]).await.unwrap();
        assert_eq!(outcome, AggregatedOutcome::default());

        let outcome = build(&["\r\n\r\n  "]).await.unwrap();
        assert_eq!(outcome.log, "");
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let err = build(&["{\"stream\":\"a\"}\r{not json}\r{\"stream\":\"b\"}\r"])
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::StreamCorrupt { step: Step::Build, .. }));
    }

    #[tokio::test]
    async fn test_aux_records_are_ignored() {
        let outcome = build(&["{\"aux\":{\"ID\":\"sha256:abc\"}}\r{\"stream\":\"x\"}\r"])
            .await
            .unwrap();
        assert_eq!(outcome.log, "x");
    }

    #[tokio::test]
    async fn test_push_field_order() {
        let outcome = push(&[
            "{\"status\":\"The push refers to repository [docker.io/library/demo]\"}\r\n",
            "{\"status\":\"Pushing\",\"progressDetail\":{\"current\":512,\"total\":1024},\"progress\":\"[=>  ]\",\"id\":\"abc123\"}\r\n",
            "{\"status\":\"Pushed\",\"progressDetail\":{},\"id\":\"abc123\"}\r\n",
        ])
        .await
        .unwrap();

        assert_eq!(
            outcome.log,
            "The push refers to repository [docker.io/library/demo]abc123[=>  ]Pushingabc123Pushed"
        );
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_push_error() {
        let outcome = push(&[
            "{\"status\":\"Preparing\",\"id\":\"abc123\"}\r",
            "{\"errorDetail\":{\"message\":\"unauthorized: authentication required\"},\"error\":\"unauthorized: authentication required\"}\r",
        ])
        .await
        .unwrap();

        assert_eq!(
            outcome.error.as_deref(),
            Some("unauthorized: authentication required")
        );
        assert_eq!(
            outcome.log,
            "abc123Preparingunauthorized: authentication required"
        );
    }

    #[tokio::test]
    async fn test_hung_stream_times_out() {
        let hung = stream::iter(vec![Ok(Bytes::from_static(b"{\"stream\":\"a\"}\r"))])
            .chain(stream::pending());
        let err = StreamAggregator::new(Step::Build)
            .with_read_timeout(Some(Duration::from_millis(50)))
            .aggregate::<BuildRecord, _>(hung)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { step: Step::Build }));
    }

    #[test]
    fn test_classify_push_record() {
        let record: PushRecord =
            serde_json::from_str(r#"{"status":"Pushed","id":"abc"}"#).unwrap();
        assert_eq!(
            record.classify(),
            ProgressRecord::Step {
                id: "abc".into(),
                progress: None,
                status: Some("Pushed".into()),
                stream: None,
            }
        );

        let record: PushRecord = serde_json::from_str(r#"{"stream":"hello"}"#).unwrap();
        assert_eq!(record.classify(), ProgressRecord::Log("hello".into()));

        let record: PushRecord = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(record.classify(), ProgressRecord::Empty);
    }

    #[test]
    fn test_decoder_rejects_oversized_record() {
        let mut decoder = RecordDecoder::default();
        let mut buf = BytesMut::from(vec![b'a'; MAX_RECORD_LEN + 1].as_slice());
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::Oversized(_))
        ));
    }
}
