//! Inter-node wire protocol.
//!
//! One TCP connection per peer pair. Each message is a UTF-8 JSON object
//! `{"op": ..., "data": ...}` terminated by a single `#`; the delimiter
//! must not appear inside payload values (market identifiers and uuids
//! never contain it).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::error::{AppError, Result};
use crate::models::Bar;

pub const FRAME_DELIMITER: u8 = b'#';

pub const OP_HELLO: &str = "hello";
pub const OP_IMPORT: &str = "import";
pub const OP_REQUEST_PENDING_BARS: &str = "requestPendingBars";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Frame {
    pub fn bare(op: &str) -> Self {
        Self {
            op: op.to_string(),
            data: None,
        }
    }

    pub fn with_data<T: Serialize>(op: &str, data: &T) -> Result<Self> {
        Ok(Self {
            op: op.to_string(),
            data: Some(serde_json::to_value(data)?),
        })
    }

    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| AppError::Cluster(format!("'{}' frame without payload", self.op)))?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Collector self-announcement, sent once after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub markets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBarsRequest {
    pub pending_bars_request_id: String,
    pub markets: Vec<String>,
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBarsResponse {
    pub pending_bars_request_id: String,
    pub results: Vec<Bar>,
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut payload = serde_json::to_vec(frame)?;
    payload.push(FRAME_DELIMITER);
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one delimited frame; `Ok(None)` means the peer closed the
/// connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut buffer = Vec::new();
    let read = reader.read_until(FRAME_DELIMITER, &mut buffer).await?;
    if read == 0 {
        return Ok(None);
    }

    if buffer.last() == Some(&FRAME_DELIMITER) {
        buffer.pop();
    }

    let frame = serde_json::from_slice(&buffer)
        .map_err(|err| AppError::Cluster(format!("malformed frame: {err}")))?;
    Ok(Some(frame))
}
