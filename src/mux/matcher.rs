//! 连接协议探测
//!
//! gRPC 连接以 HTTP/2 客户端前言开头，随后的第一个 HEADERS 块携带
//! `content-type: application/grpc[+codec|;params]`。探测器逐帧扫描已读到的
//! 字节，直到能够给出结论；字节不足时返回 [`Decision::NeedMore`]。

/// HTTP/2 客户端连接前言
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const GRPC_CONTENT_TYPE: &[u8] = b"application/grpc";

/// 连接被分流到的协议桶
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Rpc,
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rpc => "rpc",
            Protocol::Other => "other",
        }
    }
}

/// 探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Matched(Protocol),
    NeedMore,
}

/// 协议探测器
///
/// `classify` 会在每次读到新数据后以完整的已读前缀重新调用，必须是纯函数。
pub trait ProtocolMatcher: Send + Sync + 'static {
    fn classify(&self, prefix: &[u8]) -> Decision;
}

/// 默认探测器：HTTP/2 前言 + gRPC content-type
///
/// 探测期间不会向客户端发送服务端 SETTINGS 帧。先等待服务端 SETTINGS 再发送
/// HEADERS 的客户端（例如 grpc-java）会一直等到读超时，随后被归入 other；
/// 需要支持这类客户端时请通过 [`ProtocolMatcher`] 替换探测规则或调大读超时。
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcMatcher;

impl ProtocolMatcher for GrpcMatcher {
    fn classify(&self, prefix: &[u8]) -> Decision {
        let preface_len = prefix.len().min(HTTP2_PREFACE.len());
        if prefix[..preface_len] != HTTP2_PREFACE[..preface_len] {
            return Decision::Matched(Protocol::Other);
        }
        if prefix.len() < HTTP2_PREFACE.len() {
            return Decision::NeedMore;
        }
        scan_frames(&prefix[HTTP2_PREFACE.len()..])
    }
}

fn scan_frames(mut frames: &[u8]) -> Decision {
    let mut block: Option<Vec<u8>> = None;

    loop {
        if frames.len() < FRAME_HEADER_LEN {
            return Decision::NeedMore;
        }
        let length = u32::from_be_bytes([0, frames[0], frames[1], frames[2]]) as usize;
        let kind = frames[3];
        let flags = frames[4];
        let Some(payload) = frames.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + length) else {
            return Decision::NeedMore;
        };

        match (kind, block.as_mut()) {
            (FRAME_HEADERS, None) => {
                let Some(fragment) = headers_fragment(payload, flags) else {
                    return Decision::Matched(Protocol::Other);
                };
                if flags & FLAG_END_HEADERS != 0 {
                    return Decision::Matched(classify_header_block(fragment));
                }
                block = Some(fragment.to_vec());
            }
            (FRAME_CONTINUATION, Some(fragments)) => {
                fragments.extend_from_slice(payload);
                if flags & FLAG_END_HEADERS != 0 {
                    return Decision::Matched(classify_header_block(fragments));
                }
            }
            // 头部块必须连续；任何穿插的帧都是协议错误
            (_, Some(_)) | (FRAME_CONTINUATION, None) => {
                return Decision::Matched(Protocol::Other);
            }
            // SETTINGS、WINDOW_UPDATE、PING、PRIORITY 等连接级帧
            _ => {}
        }

        frames = &frames[FRAME_HEADER_LEN + length..];
    }
}

/// 去掉 HEADERS 帧的填充和优先级字段
fn headers_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut payload = payload;
    if flags & FLAG_PADDED != 0 {
        let (&pad_len, rest) = payload.split_first()?;
        payload = rest.get(..rest.len().checked_sub(pad_len as usize)?)?;
    }
    if flags & FLAG_PRIORITY != 0 {
        payload = payload.get(5..)?;
    }
    Some(payload)
}

fn classify_header_block(block: &[u8]) -> Protocol {
    if !well_formed(block) {
        return Protocol::Other;
    }
    match hpack::Decoder::new().decode(block) {
        Ok(headers) => headers
            .iter()
            .find(|(name, _)| name.as_slice() == b"content-type")
            .map_or(Protocol::Other, |(_, value)| {
                if is_grpc_content_type(value) {
                    Protocol::Rpc
                } else {
                    Protocol::Other
                }
            }),
        Err(_) => Protocol::Other,
    }
}

/// 整数编码最多允许的续字节数，足以表示任何合理的索引与长度
const MAX_INTEGER_CONTINUATION: usize = 4;

/// 检查头部块中每条表示的整数与字符串长度编码都完整且不溢出
///
/// `hpack` 解码器在截断或超长的整数编码上会 panic，而这些字节完全由
/// 远端控制，所以结构检查必须在解码之前完成。
fn well_formed(mut block: &[u8]) -> bool {
    while let Some(&first) = block.first() {
        // (整数前缀位数, 是否为字面量表示)
        let (prefix, literal) = match first {
            b if b & 0x80 != 0 => (7, false),
            b if b & 0xc0 == 0x40 => (6, true),
            b if b & 0xe0 == 0x20 => (5, false),
            _ => (4, true),
        };
        let Some((index, rest)) = decode_integer(block, prefix) else {
            return false;
        };
        block = rest;

        if first & 0x80 != 0 && index == 0 {
            return false;
        }
        if literal {
            if index == 0 {
                let Some(rest) = skip_string(block) else {
                    return false;
                };
                block = rest;
            }
            let Some(rest) = skip_string(block) else {
                return false;
            };
            block = rest;
        }
    }
    true
}

/// RFC 7541 §5.1 整数解码，返回值与剩余字节
fn decode_integer(buf: &[u8], prefix: u32) -> Option<(usize, &[u8])> {
    let mask = (1usize << prefix) - 1;
    let (&first, mut rest) = buf.split_first()?;
    let mut value = usize::from(first) & mask;
    if value < mask {
        return Some((value, rest));
    }
    for i in 0..MAX_INTEGER_CONTINUATION {
        let (&byte, tail) = rest.split_first()?;
        rest = tail;
        value += usize::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, rest));
        }
    }
    None
}

/// 跳过一个字符串字面量（Huffman 标志位 + 7 位前缀长度）
fn skip_string(buf: &[u8]) -> Option<&[u8]> {
    let (len, rest) = decode_integer(buf, 7)?;
    rest.get(len..)
}

/// `application/grpc`，可带 `+proto` 之类的编码后缀或 `;` 参数
pub fn is_grpc_content_type(value: &[u8]) -> bool {
    if value.len() < GRPC_CONTENT_TYPE.len()
        || !value[..GRPC_CONTENT_TYPE.len()].eq_ignore_ascii_case(GRPC_CONTENT_TYPE)
    {
        return false;
    }
    matches!(value.get(GRPC_CONTENT_TYPE.len()), None | Some(b'+') | Some(b';'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = len.to_be_bytes()[1..].to_vec();
        out.push(kind);
        out.push(flags);
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn header_block(headers: &[(&str, &str)]) -> Vec<u8> {
        let headers = headers
            .iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        hpack::Encoder::new().encode(&headers)
    }

    fn connection(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut out = HTTP2_PREFACE.to_vec();
        // 空 SETTINGS 帧
        out.extend(frame(0x4, 0, &[]));
        for f in frames {
            out.extend_from_slice(f);
        }
        out
    }

    fn grpc_headers(content_type: &str) -> Vec<u8> {
        header_block(&[
            (":method", "POST"),
            (":scheme", "http"),
            (":path", "/test.Echo/Say"),
            (":authority", "localhost"),
            ("content-type", content_type),
            ("te", "trailers"),
        ])
    }

    #[test]
    fn grpc_request_is_rpc() {
        let bytes = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS, &grpc_headers("application/grpc"))]);
        assert_eq!(GrpcMatcher.classify(&bytes), Decision::Matched(Protocol::Rpc));
    }

    #[test]
    fn grpc_codec_suffix_is_rpc() {
        let bytes = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS, &grpc_headers("application/grpc+proto"))]);
        assert_eq!(GrpcMatcher.classify(&bytes), Decision::Matched(Protocol::Rpc));
    }

    #[test]
    fn grpc_web_is_other() {
        let bytes = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS, &grpc_headers("application/grpc-web"))]);
        assert_eq!(GrpcMatcher.classify(&bytes), Decision::Matched(Protocol::Other));
    }

    #[test]
    fn headers_split_over_continuation() {
        let block = grpc_headers("application/grpc");
        let (head, tail) = block.split_at(block.len() / 2);
        let bytes = connection(&[frame(FRAME_HEADERS, 0, head), frame(FRAME_CONTINUATION, FLAG_END_HEADERS, tail)]);
        assert_eq!(GrpcMatcher.classify(&bytes), Decision::Matched(Protocol::Rpc));

        // 尚未收到 CONTINUATION
        let partial = connection(&[frame(FRAME_HEADERS, 0, head)]);
        assert_eq!(GrpcMatcher.classify(&partial), Decision::NeedMore);
    }

    #[test]
    fn padded_and_prioritized_headers() {
        let block = grpc_headers("application/grpc");
        let mut payload = vec![3u8];
        payload.extend_from_slice(&[0, 0, 0, 0, 16]);
        payload.extend_from_slice(&block);
        payload.extend_from_slice(&[0, 0, 0]);
        let bytes = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS | FLAG_PADDED | FLAG_PRIORITY, &payload)]);
        assert_eq!(GrpcMatcher.classify(&bytes), Decision::Matched(Protocol::Rpc));
    }

    #[test]
    fn http1_is_other_immediately() {
        assert_eq!(
            GrpcMatcher.classify(b"GET / HTTP/1.1\r\n"),
            Decision::Matched(Protocol::Other)
        );
        assert_eq!(GrpcMatcher.classify(b"G"), Decision::Matched(Protocol::Other));
    }

    #[test]
    fn partial_preface_needs_more() {
        assert_eq!(GrpcMatcher.classify(b""), Decision::NeedMore);
        assert_eq!(GrpcMatcher.classify(&HTTP2_PREFACE[..10]), Decision::NeedMore);
        assert_eq!(GrpcMatcher.classify(HTTP2_PREFACE), Decision::NeedMore);
    }

    #[test]
    fn partial_frame_needs_more() {
        let bytes = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS, &grpc_headers("application/grpc"))]);
        assert_eq!(GrpcMatcher.classify(&bytes[..bytes.len() - 1]), Decision::NeedMore);
    }

    #[test]
    fn interleaved_frame_inside_header_block_is_other() {
        let block = grpc_headers("application/grpc");
        let bytes = connection(&[frame(FRAME_HEADERS, 0, &block), frame(0x8, 0, &[0, 0, 0, 1])]);
        assert_eq!(GrpcMatcher.classify(&bytes), Decision::Matched(Protocol::Other));
    }

    #[test]
    fn malformed_integer_encodings_are_other() {
        // 截断的动态表大小更新
        let truncated = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS, &[0x3f])]);
        assert_eq!(GrpcMatcher.classify(&truncated), Decision::Matched(Protocol::Other));

        // 续字节过多
        let mut oversized = vec![0x3f];
        oversized.extend_from_slice(&[0xff; 6]);
        let oversized = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS, &oversized)]);
        assert_eq!(GrpcMatcher.classify(&oversized), Decision::Matched(Protocol::Other));

        // 索引 0 不合法
        let zero_index = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS, &[0x80])]);
        assert_eq!(GrpcMatcher.classify(&zero_index), Decision::Matched(Protocol::Other));
    }

    #[test]
    fn truncated_string_literal_is_other() {
        let mut block = grpc_headers("application/grpc");
        // 字面量名 + 声称 20 字节却只给出 3 字节的值
        block.extend_from_slice(&[0x00, 0x01, b'x', 0x14, b'a', b'b', b'c']);
        let bytes = connection(&[frame(FRAME_HEADERS, FLAG_END_HEADERS, &block)]);
        assert_eq!(GrpcMatcher.classify(&bytes), Decision::Matched(Protocol::Other));
    }

    #[test]
    fn encoder_output_is_well_formed() {
        assert!(well_formed(&grpc_headers("application/grpc")));
        assert!(well_formed(&[]));
    }

    #[test]
    fn content_type_rules() {
        assert!(is_grpc_content_type(b"application/grpc"));
        assert!(is_grpc_content_type(b"application/grpc+json"));
        assert!(is_grpc_content_type(b"application/grpc;charset=utf-8"));
        assert!(is_grpc_content_type(b"Application/GRPC"));
        assert!(!is_grpc_content_type(b"application/grpc-web+proto"));
        assert!(!is_grpc_content_type(b"application/json"));
        assert!(!is_grpc_content_type(b"application/grp"));
    }
}
