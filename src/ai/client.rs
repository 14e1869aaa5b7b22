//! Streaming client for OpenAI-compatible endpoints.
//!
//! One context is built at startup and shared by every session; there is no
//! module-level client state.  Responses stream as server-sent events and
//! are decoded line by line, so tokens reach the UI as they arrive.

use std::io::{BufRead, BufReader};
use std::time::Duration;

use serde::Serialize;

use crate::errors::{LlsError, LlsResult};

/// Shared endpoint configuration plus the HTTP client.
pub struct AiContext {
    base_url: String,
    api_key: String,
    pub default_model: String,
    http: reqwest::blocking::Client,
}

/// Message as the chat endpoint expects it.
#[derive(Clone, Debug, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Copy, Debug)]
enum StreamKind {
    Chat,
    Completion,
}

impl AiContext {
    pub fn new(base_url: &str, api_key: &str, default_model: &str) -> Self {
        // No overall timeout: a generation stream stays open as long as the
        // model keeps producing.
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(None)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        AiContext {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_model: default_model.to_string(),
            http,
        }
    }

    /// Open a streaming chat completion.
    pub fn chat_stream(&self, model: &str, messages: &[WireMessage]) -> LlsResult<SseStream> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        self.post_stream("/v1/chat/completions", body, StreamKind::Chat)
    }

    /// Open a streaming text completion.
    pub fn completion_stream(&self, model: &str, prompt: &str) -> LlsResult<SseStream> {
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": true,
        });
        self.post_stream("/v1/completions", body, StreamKind::Completion)
    }

    fn post_stream(
        &self,
        path: &str,
        body: serde_json::Value,
        kind: StreamKind,
    ) -> LlsResult<SseStream> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req
            .send()
            .map_err(|e| LlsError::Generate(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().unwrap_or_default();
            body.truncate(200);
            return Err(LlsError::Generate(format!(
                "{} from {}: {}",
                status,
                url,
                body.trim()
            )));
        }
        Ok(SseStream {
            reader: Box::new(BufReader::new(resp)),
            kind,
            done: false,
        })
    }
}

/// Iterator over the content deltas of a server-sent-event response.
pub struct SseStream {
    reader: Box<dyn BufRead + Send>,
    kind: StreamKind,
    done: bool,
}

impl Iterator for SseStream {
    type Item = LlsResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(LlsError::Generate(e.to_string())));
                }
            }
            let line = line.trim();
            let data = match line.strip_prefix("data:") {
                Some(d) => d.trim(),
                None => continue,
            };
            if data == "[DONE]" {
                self.done = true;
                return None;
            }
            let value: serde_json::Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    self.done = true;
                    return Some(Err(LlsError::Generate(format!(
                        "malformed stream chunk: {e}"
                    ))));
                }
            };
            let delta = match self.kind {
                StreamKind::Chat => value["choices"][0]["delta"]["content"].as_str(),
                StreamKind::Completion => value["choices"][0]["text"].as_str(),
            };
            return Some(Ok(delta.unwrap_or("").to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn chat_stream(frames: &str) -> SseStream {
        SseStream {
            reader: Box::new(Cursor::new(frames.as_bytes().to_vec())),
            kind: StreamKind::Chat,
            done: false,
        }
    }

    #[test]
    fn test_sse_chat_deltas() {
        let frames = "data: {\"choices\":[{\"delta\":{\"content\":\"ls\"}}]}\n\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\" -la\"}}]}\n\n\
                      data: [DONE]\n";
        let got: Vec<String> = chat_stream(frames).map(|r| r.unwrap()).collect();
        assert_eq!(got, vec!["ls", " -la"]);
    }

    #[test]
    fn test_sse_skips_blank_and_comment_lines() {
        let frames = ": keepalive\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n";
        let got: Vec<String> = chat_stream(frames).map(|r| r.unwrap()).collect();
        assert_eq!(got, vec!["x"]);
    }

    #[test]
    fn test_sse_null_delta_is_empty_string() {
        // The final chat chunk usually carries no content field.
        let frames = "data: {\"choices\":[{\"delta\":{}}]}\ndata: [DONE]\n";
        let got: Vec<String> = chat_stream(frames).map(|r| r.unwrap()).collect();
        assert_eq!(got, vec![""]);
    }

    #[test]
    fn test_sse_completion_text_field() {
        let frames = "data: {\"choices\":[{\"text\":\"echo hi\"}]}\ndata: [DONE]\n";
        let stream = SseStream {
            reader: Box::new(Cursor::new(frames.as_bytes().to_vec())),
            kind: StreamKind::Completion,
            done: false,
        };
        let got: Vec<String> = stream.map(|r| r.unwrap()).collect();
        assert_eq!(got, vec!["echo hi"]);
    }

    #[test]
    fn test_sse_malformed_chunk_terminates_with_error() {
        let frames = "data: {not json\n";
        let mut stream = chat_stream(frames);
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_think_extraction_progression() {
        // Chunks <think>, reason, </think>, ls arrive one at a time; the
        // consumer sees the think text settle before the command appears.
        use crate::ai::CommandStream;
        let frames = [
            "<think>",
            "reason",
            "</think>",
            "ls",
        ]
        .iter()
        .map(|c| {
            format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n",
                serde_json::json!(c)
            )
        })
        .collect::<String>()
            + "data: [DONE]\n";
        let stream = CommandStream::new(Box::new(move || {
            Ok(SseStream {
                reader: Box::new(Cursor::new(frames.into_bytes())),
                kind: StreamKind::Chat,
                done: false,
            })
        }));
        let got: Vec<_> = stream.collect();
        assert_eq!(
            got,
            vec![
                ("".to_string(), "".to_string()),
                ("".to_string(), "".to_string()),
                ("".to_string(), "reason".to_string()),
                ("".to_string(), "reason".to_string()),
                ("ls".to_string(), "reason".to_string()),
            ]
        );
    }
}
