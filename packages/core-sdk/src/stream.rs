/*!
 * \brief 响应体的增量解码器。
 * \details 只在凑齐完整单元（整行、完整 JSON 对象）后输出，结果与传输分块方式无关。每个请求持有自己的解码器。
 */

/**
 * \brief SSE 行解码结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseData {
    /** \brief `data: ` 之后的负载 */
    Payload(String),
    /** \brief `[DONE]` 终止标记 */
    Done,
}

/**
 * \brief 逐行解析 Server-Sent-Events，只提取 `data:` 行。
 */
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 追加字节并返回所有已完整的 data 行。终止标记之后的内容被忽略。
     */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseData> {
        if self.done {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            if let Some(data) = self.decode_line(&line) {
                out.push(data);
                if self.done {
                    self.buf.clear();
                    break;
                }
            }
        }
        out
    }

    /**
     * \brief 处理末尾没有换行符的最后一行。
     */
    pub fn finish(&mut self) -> Vec<SseData> {
        if self.done || self.buf.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buf);
        self.decode_line(&line).into_iter().collect()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<SseData> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        let payload = line.strip_prefix("data:")?.trim_start();
        if payload.is_empty() {
            return None;
        }
        if payload == "[DONE]" {
            self.done = true;
            return Some(SseData::Done);
        }
        Some(SseData::Payload(payload.to_string()))
    }
}

/**
 * \brief 在字节流中增量识别完整的顶层 JSON 对象（Gemini 流式响应）。
 * \details 只跟踪花括号深度；字符串内的花括号与反斜杠转义被正确跳过。
 *          对象之外的 `[`、`,`、空白等分隔符被忽略。
 */
#[derive(Debug, Default)]
pub struct JsonObjectScanner {
    buf: Vec<u8>,
    /** \brief 下一个待扫描的位置 */
    pos: usize,
    depth: usize,
    start: Option<usize>,
    in_string: bool,
    escaped: bool,
    objects_seen: usize,
}

impl JsonObjectScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 追加字节，返回本次新完成的对象文本；已消费的字节会从缓冲区移除。
     */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while self.pos < self.buf.len() {
            let byte = self.buf[self.pos];
            let index = self.pos;
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' if self.depth > 0 => self.in_string = true,
                b'{' => {
                    if self.depth == 0 {
                        self.start = Some(index);
                    }
                    self.depth += 1;
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Some(start) = self.start.take() {
                            out.push(String::from_utf8_lossy(&self.buf[start..=index]).into_owned());
                            self.objects_seen += 1;
                            self.buf.drain(..=index);
                            self.pos = 0;
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /**
     * \brief 已识别出的对象总数。
     */
    pub fn objects_seen(&self) -> usize {
        self.objects_seen
    }

    /**
     * \brief 尚未被消费的字节；若从未识别出对象，即为完整响应体。
     */
    pub fn remaining(&self) -> &[u8] {
        &self.buf
    }
}
