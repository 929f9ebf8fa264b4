use bytes::Bytes;

/// Incremental SSE `data:` line decoder. Adapted to the narrower discipline
/// this gateway's adapters need: only `data:` lines matter, `[DONE]`
/// terminates the stream, `:`-prefixed lines are comments.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: String,
}

pub enum SseLine {
    Data(String),
    Done,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<SseLine> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    fn push_str(&mut self, chunk: &str) -> Vec<SseLine> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                out.push(SseLine::Done);
            } else if !data.is_empty() {
                out.push(SseLine::Data(data.to_string()));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_data_and_done() {
        let mut decoder = SseLineDecoder::new();
        let lines = decoder.push(&Bytes::from_static(
            b": heartbeat\ndata: {\"a\":1}\n\ndata: [DONE]\n\n",
        ));
        assert_eq!(lines.len(), 2);
        assert!(matches!(&lines[0], SseLine::Data(s) if s == "{\"a\":1}"));
        assert!(matches!(lines[1], SseLine::Done));
    }

    #[test]
    fn ignores_comment_lines() {
        let mut decoder = SseLineDecoder::new();
        let lines = decoder.push(&Bytes::from_static(b":comment\ndata: x\n\n"));
        assert_eq!(lines.len(), 1);
    }
}
