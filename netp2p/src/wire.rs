//! Wire format: newline-delimited JSON frames of `{type, data}`, per
//! spec.md §6. Each message payload is a plain struct; the frame itself
//! carries the discriminant as a string so unknown message types can be
//! logged and dropped rather than failing the whole connection.

use primitives::types::{Block, Transaction};
use primitives::Hash;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(kind: &str, data: impl Serialize) -> Frame {
        Frame {
            kind: kind.to_string(),
            data: serde_json::to_value(data).expect("message payload always serializes"),
        }
    }

    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).expect("frame always serializes");
        s.push('\n');
        s
    }

    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub version: u32,
    pub chain_id: u64,
    pub genesis_hash: Hash,
    pub best_height: u64,
    pub services: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeError {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inv {
    #[serde(rename = "type")]
    pub kind: String,
    pub items: Vec<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetData {
    pub items: Vec<Hash>,
}

pub const PROTOCOL_VERSION: u32 = 1;

pub fn version_frame(chain_id: u64, genesis_hash: Hash, best_height: u64) -> Frame {
    Frame::new(
        "version",
        Version {
            version: PROTOCOL_VERSION,
            chain_id,
            genesis_hash,
            best_height,
            services: 0,
        },
    )
}

pub fn handshake_error_frame(message: &str) -> Frame {
    Frame::new(
        "handshake_error",
        HandshakeError {
            message: message.to_string(),
        },
    )
}

pub fn handshake_success_frame() -> Frame {
    Frame::new("handshake_success", serde_json::json!({}))
}

pub fn block_frame(block: &Block) -> Frame {
    Frame::new("block", block)
}

pub fn tx_frame(tx: &Transaction) -> Frame {
    Frame::new("tx", tx)
}

pub fn inv_blocks_frame(items: Vec<Hash>) -> Frame {
    Frame::new(
        "inv",
        Inv {
            kind: "block".to_string(),
            items,
        },
    )
}

pub fn getdata_frame(items: Vec<Hash>) -> Frame {
    Frame::new("getdata", GetData { items })
}
