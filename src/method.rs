//! Deferred method calls: "run `method` on this type, or on the record with
//! this id". Only the identifiers are persisted; the receiver is resolved
//! through a [`MethodTable`] when the job runs.

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use bincode::{Decode, Encode};
use thiserror::Error;
use tracing::debug;

use crate::{
    error::{Error, Result},
    payload::{PayloadRegistry, Performable},
};

/// Type discriminator stored for method-call jobs.
pub const METHOD_CALL_TYPE: &str = "PerformableMethod";

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Receiver {
    /// Associated function of a named type.
    Type(String),
    /// Method on a persisted record, loaded by id at run time.
    Record { kind: String, id: i64 },
}

impl Receiver {
    pub fn kind(&self) -> &str {
        match self {
            Receiver::Type(kind) | Receiver::Record { kind, .. } => kind,
        }
    }

    pub fn record_id(&self) -> Option<i64> {
        match self {
            Receiver::Type(_) => None,
            Receiver::Record { id, .. } => Some(*id),
        }
    }
}

impl fmt::Display for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Receiver::Type(kind) => write!(f, "{}", kind),
            Receiver::Record { kind, id } => write!(f, "{}:{}", kind, id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MethodCall {
    pub receiver: Receiver,
    pub method: String,
    pub args: Vec<String>,
}

impl MethodCall {
    /// `Type.method` for type receivers, `Kind#method` for records.
    pub fn display_name(&self) -> String {
        match &self.receiver {
            Receiver::Type(kind) => format!("{}.{}", kind, self.method),
            Receiver::Record { kind, .. } => format!("{}#{}", kind, self.method),
        }
    }
}

#[derive(Debug, Error)]
pub enum MethodError {
    /// The receiving record was deleted after the job was enqueued.
    #[error("{kind} {id} no longer exists")]
    RecordNotFound { kind: String, id: i64 },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Arguments handed to a registered method.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub receiver: Receiver,
    pub args: Vec<String>,
}

type MethodResult = std::result::Result<Option<String>, MethodError>;

type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;

type BoxedHandler = Box<dyn Fn(Invocation) -> MethodFuture + Send + Sync>;

/// Methods that may be called later, keyed by receiver kind and method name.
#[derive(Default)]
pub struct MethodTable {
    handlers: HashMap<String, HashMap<String, BoxedHandler>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, kind: &str, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let boxed: BoxedHandler =
            Box::new(move |invocation| -> MethodFuture { Box::pin(handler(invocation)) });
        self.handlers
            .entry(kind.to_string())
            .or_default()
            .insert(method.to_string(), boxed);
        self
    }

    pub fn responds_to(&self, kind: &str, method: &str) -> bool {
        self.handler(kind, method).is_some()
    }

    fn handler(&self, kind: &str, method: &str) -> Option<&BoxedHandler> {
        self.handlers.get(kind).and_then(|methods| methods.get(method))
    }

    /// Build a call for later, rejecting methods nobody registered.
    pub fn call(
        &self,
        receiver: Receiver,
        method: impl Into<String>,
        args: Vec<String>,
    ) -> Result<MethodCall> {
        let method = method.into();
        if !self.responds_to(receiver.kind(), &method) {
            return Err(Error::UnknownMethod {
                receiver: receiver.to_string(),
                method,
            });
        }
        Ok(MethodCall {
            receiver,
            method,
            args,
        })
    }

    /// Run `call`. A receiver that no longer exists makes the call a no-op.
    pub async fn invoke(&self, call: &MethodCall) -> anyhow::Result<Option<String>> {
        let handler = self.handler(call.receiver.kind(), &call.method).ok_or_else(|| {
            anyhow!(Error::UnknownMethod {
                receiver: call.receiver.to_string(),
                method: call.method.clone(),
            })
        })?;

        let invocation = Invocation {
            receiver: call.receiver.clone(),
            args: call.args.clone(),
        };
        match handler(invocation).await {
            Ok(value) => Ok(value),
            Err(MethodError::RecordNotFound { kind, id }) => {
                debug!(kind = %kind, id, method = %call.method, "receiver is gone, skipping call");
                Ok(None)
            }
            Err(MethodError::Failed(e)) => Err(e),
        }
    }
}

struct BoundMethod {
    call: MethodCall,
    table: Arc<MethodTable>,
}

#[async_trait]
impl Performable for BoundMethod {
    async fn perform(&self) -> anyhow::Result<Option<String>> {
        self.table.invoke(&self.call).await
    }

    fn display_name(&self) -> Option<String> {
        Some(self.call.display_name())
    }
}

impl PayloadRegistry {
    /// Make method-call jobs runnable through `table`.
    pub fn register_methods(&mut self, table: Arc<MethodTable>) -> &mut Self {
        let config = self.bincode_config();
        self.register_factory(METHOD_CALL_TYPE, move |bytes| {
            let (call, _): (MethodCall, usize) = bincode::decode_from_slice(bytes, config)
                .map_err(|e| Error::Deserialization(format!("{}: {}", METHOD_CALL_TYPE, e)))?;
            if !table.responds_to(call.receiver.kind(), &call.method) {
                return Err(Error::Deserialization(format!(
                    "undefined method `{}` for {}",
                    call.method, call.receiver
                )));
            }
            Ok(Arc::new(BoundMethod {
                call,
                table: Arc::clone(&table),
            }) as Arc<dyn Performable>)
        })
    }
}
