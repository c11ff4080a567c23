//! Wire format: a 6-byte configurable magic header, a big-endian u32
//! payload length, then a JSON-encoded `NetData`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DispatchError;

/// Default 6-byte frame magic.
pub const DEFAULT_MAGIC: &str = "arachn";
pub const MAGIC_LEN: usize = 6;
const LEN_BYTES: usize = 4;
/// Upper bound on a single frame payload.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Operation a worker sends right after connecting; must address the
/// master's UID or the connection is rejected.
pub const OP_IDENTITY: &str = "+identity+";
/// Keep-alive written by a worker whose write lane idles past the timeout.
pub const OP_HEARTBEAT: &str = "+heartbeat+";

pub const STATUS_OK: i32 = 0;
pub const STATUS_FAILURE: i32 = -1;
pub const STATUS_REJECTED: i32 = -2;

/// One dispatch message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetData {
    pub from: String,
    pub to: String,
    pub operation: String,
    pub flag: String,
    pub status: i32,
    pub body: Value,
}

impl NetData {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        operation: impl Into<String>,
        flag: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            operation: operation.into(),
            flag: flag.into(),
            status: STATUS_OK,
            body,
        }
    }

    /// Status-carrying error reply to `original`.
    pub fn error_reply(original: &NetData, own_uid: &str, status: i32, message: &str) -> Self {
        Self {
            from: own_uid.to_string(),
            to: original.from.clone(),
            operation: original.operation.clone(),
            flag: original.flag.clone(),
            status,
            body: Value::String(message.to_string()),
        }
    }
}

/// Incremental frame parser. Feed raw TCP bytes in any chunking; every
/// complete frame comes back out exactly once.
pub struct FrameCodec {
    magic: [u8; MAGIC_LEN],
    buf: Vec<u8>,
}

impl FrameCodec {
    pub fn new(magic: &str) -> Result<Self, DispatchError> {
        let bytes = magic.as_bytes();
        if bytes.len() != MAGIC_LEN {
            return Err(DispatchError::BadMagicLength(magic.len()));
        }
        let mut fixed = [0u8; MAGIC_LEN];
        fixed.copy_from_slice(bytes);
        Ok(Self {
            magic: fixed,
            buf: Vec::new(),
        })
    }

    pub fn encode(&self, data: &NetData) -> Result<Vec<u8>, DispatchError> {
        let payload =
            serde_json::to_vec(data).map_err(|e| DispatchError::Decode(e.to_string()))?;
        if payload.len() > MAX_FRAME {
            return Err(DispatchError::Oversize(payload.len()));
        }
        let mut frame = Vec::with_capacity(MAGIC_LEN + LEN_BYTES + payload.len());
        frame.extend_from_slice(&self.magic);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete frame, `None` while more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<NetData>, DispatchError> {
        if self.buf.len() < MAGIC_LEN + LEN_BYTES {
            return Ok(None);
        }
        if self.buf[..MAGIC_LEN] != self.magic {
            return Err(DispatchError::BadMagic);
        }
        let len = u32::from_be_bytes(
            self.buf[MAGIC_LEN..MAGIC_LEN + LEN_BYTES]
                .try_into()
                .expect("fixed slice"),
        ) as usize;
        if len > MAX_FRAME {
            return Err(DispatchError::Oversize(len));
        }
        let total = MAGIC_LEN + LEN_BYTES + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let data = serde_json::from_slice(&self.buf[MAGIC_LEN + LEN_BYTES..total])
            .map_err(|e| DispatchError::Decode(e.to_string()))?;
        self.buf.drain(..total);
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(i: usize) -> NetData {
        NetData::new(
            "worker-1",
            "master",
            "task",
            format!("flag-{i}"),
            json!({ "seq": i, "payload": "x".repeat(i * 7 % 50) }),
        )
    }

    #[test]
    fn rejects_wrong_magic_size() {
        assert!(FrameCodec::new("toolongmagic").is_err());
        assert!(FrameCodec::new(DEFAULT_MAGIC).is_ok());
    }

    #[test]
    fn decode_is_chunking_independent() {
        let codec = FrameCodec::new(DEFAULT_MAGIC).unwrap();
        let mut stream = Vec::new();
        for i in 0..10 {
            stream.extend(codec.encode(&sample(i)).unwrap());
        }

        // replay the byte stream with several chunk sizes
        for chunk in [1usize, 3, 7, 64, stream.len()] {
            let mut decoder = FrameCodec::new(DEFAULT_MAGIC).unwrap();
            let mut seen = Vec::new();
            for piece in stream.chunks(chunk) {
                decoder.feed(piece);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    seen.push(frame);
                }
            }
            assert_eq!(seen.len(), 10, "chunk size {chunk}");
            for (i, frame) in seen.iter().enumerate() {
                assert_eq!(frame.flag, format!("flag-{i}"));
                assert_eq!(frame.body["seq"], json!(i));
            }
        }
    }

    #[test]
    fn mismatched_magic_is_an_error() {
        let sender = FrameCodec::new("abcdef").unwrap();
        let mut receiver = FrameCodec::new(DEFAULT_MAGIC).unwrap();
        receiver.feed(&sender.encode(&sample(0)).unwrap());
        assert!(matches!(
            receiver.next_frame(),
            Err(DispatchError::BadMagic)
        ));
    }
}
