//! Payloads are stored as a type name plus a bincode blob. A
//! [`PayloadRegistry`] maps each type name back to a factory that rebuilds
//! a runnable [`Performable`].

use std::{collections::HashMap, sync::Arc};

use aide_de_camp::core::Bytes;
use async_trait::async_trait;
use bincode::{Decode, Encode};

use crate::error::{Error, Result};

/// The work a job carries.
#[async_trait]
pub trait Performable: Send + Sync {
    /// Run the job. The returned value is kept as the job's result when
    /// the job asks to be retained after success.
    async fn perform(&self) -> anyhow::Result<Option<String>>;

    fn display_name(&self) -> Option<String> {
        None
    }

    /// Overrides the queue-wide attempt limit.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// Keep the record as `successful` instead of deleting it.
    fn keep_after_success(&self) -> bool {
        false
    }

    /// Receives the job's public unique key when the payload is loaded,
    /// so long-running work can report progress under it.
    fn set_job_key(&self, _key: &str) {}
}

/// A concrete payload type that can be enqueued.
pub trait Payload: Performable + Encode + Decode + 'static {
    /// Type discriminator persisted next to the encoded payload.
    fn name() -> &'static str;
}

type Factory = Box<dyn Fn(&[u8]) -> Result<Arc<dyn Performable>> + Send + Sync>;

pub struct PayloadRegistry {
    factories: HashMap<String, Factory>,
    bincode_config: bincode::config::Configuration,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            bincode_config: bincode::config::standard(),
        }
    }

    pub fn register<P: Payload>(&mut self) -> &mut Self {
        let config = self.bincode_config;
        self.register_factory(P::name(), move |bytes| {
            let (payload, _): (P, usize) = bincode::decode_from_slice(bytes, config)
                .map_err(|e| Error::Deserialization(format!("{}: {}", P::name(), e)))?;
            Ok(Arc::new(payload) as Arc<dyn Performable>)
        })
    }

    /// Register a custom reconstruction step for `job_type`.
    pub fn register_factory<F>(&mut self, job_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&[u8]) -> Result<Arc<dyn Performable>> + Send + Sync + 'static,
    {
        self.factories.insert(job_type.into(), Box::new(factory));
        self
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn encode<T: Encode>(&self, payload: &T) -> Result<Bytes> {
        let bytes = bincode::encode_to_vec(payload, self.bincode_config)
            .map_err(|e| Error::Encode(e.to_string()))?;
        Ok(bytes.into())
    }

    pub(crate) fn bincode_config(&self) -> bincode::config::Configuration {
        self.bincode_config
    }

    /// Rebuild the payload stored under `job_type`.
    pub fn decode(&self, job_type: &str, payload: &[u8]) -> Result<Arc<dyn Performable>> {
        let factory = self.factories.get(job_type).ok_or_else(|| {
            Error::Deserialization(format!("unknown payload type `{}`", job_type))
        })?;
        factory(payload)
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
