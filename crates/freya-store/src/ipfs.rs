//! IPFS HTTP API block store.
//!
//! Talks to a local daemon (default `http://localhost:5001/api/v0`).
//! `put` uploads the block as a multipart form to `/block/put` and reads
//! the CID from the `Key` field of the JSON response; `get` posts to
//! `/block/get?arg=<cid>` and returns the raw body.

use reqwest::blocking::{multipart, Client};

use crate::{BlockStore, Cid, Result, StoreError};

pub const DEFAULT_API: &str = "http://localhost:5001/api/v0";

#[derive(Debug, Clone)]
pub struct IpfsBlockStore {
    client: Client,
    api_base: String,
}

impl IpfsBlockStore {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into(),
        }
    }
}

impl Default for IpfsBlockStore {
    fn default() -> Self {
        Self::new(DEFAULT_API)
    }
}

impl BlockStore for IpfsBlockStore {
    fn put(&self, data: &[u8]) -> Result<Cid> {
        let form = multipart::Form::new()
            .part("data", multipart::Part::bytes(data.to_vec()));
        let response = self
            .client
            .post(format!("{}/block/put", self.api_base))
            .multipart(form)
            .send()?
            .error_for_status()?;

        let body: serde_json::Value = response.json()?;
        match body.get("Key").and_then(|k| k.as_str()) {
            Some(key) => Ok(Cid(key.to_string())),
            None => Err(StoreError::Api(format!(
                "block/put response missing Key: {body}"
            ))),
        }
    }

    fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(format!("{}/block/get", self.api_base))
            .query(&[("arg", cid.as_str())])
            .send()?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                cid: cid.as_str().to_string(),
            });
        }
        let response = response.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }
}
