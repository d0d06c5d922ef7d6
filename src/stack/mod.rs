//! Stack commands: deploy, remove and the listing commands
//!
//! User-facing progress lines go through [`Output`], not through `tracing`,
//! so tests can capture exactly what a user would see.

pub mod deploy;
pub mod list;
pub mod progress;
pub mod remove;

use crate::convert::namespace_filter;
use crate::engine::{EngineApi, Filters, ServiceListOptions};
use crate::error::{Result, StackError};
use crate::swarm::{Config, NetworkResource, Secret, Service};
use std::fmt::Display;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

pub use deploy::{deploy, DeployOptions, ResolveImage};
pub use list::{list_stacks, ps, services, PsOptions, ServicesOptions};
pub use remove::{remove, RemoveOptions};

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Standard output and standard error for user-facing lines
#[derive(Clone)]
pub struct Output {
    out: Sink,
    err: Sink,
}

impl Output {
    pub fn stdio() -> Self {
        Self::new(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn new(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
            err: Arc::new(Mutex::new(err)),
        }
    }

    /// Output writing into two in-memory buffers
    pub fn capture() -> (Self, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        (
            Self::new(Box::new(out.clone()), Box::new(err.clone())),
            out,
            err,
        )
    }

    /// Write one line to standard output
    pub fn out(&self, line: impl Display) {
        write_line(&self.out, line);
    }

    /// Write one line to standard error
    pub fn err(&self, line: impl Display) {
        write_line(&self.err, line);
    }

    /// Write preformatted text to standard output as is
    pub fn out_raw(&self, text: &str) {
        let mut sink = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = sink.write_all(text.as_bytes());
        let _ = sink.flush();
    }
}

fn write_line(sink: &Sink, line: impl Display) {
    let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
    // A closed pipe must not abort a deploy half-way
    let _ = writeln!(sink, "{}", line);
    let _ = sink.flush();
}

/// Cloneable in-memory writer
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap_or_else(|e| e.into_inner())).to_string()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reject names that are empty once quotes and whitespace are trimmed
pub fn validate_stack_name(namespace: &str) -> Result<()> {
    let trimmed = namespace.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
    if trimmed.is_empty() {
        return Err(StackError::Usage(format!(
            "invalid stack name: {:?}",
            namespace
        )));
    }
    Ok(())
}

/// Namespace label filter plus user-supplied `key=value` filters
pub fn stack_filter(namespace: &str, extra: &[String]) -> Result<Filters> {
    let mut filters = Filters::new().with("label", namespace_filter(namespace));
    for arg in extra {
        filters.parse_arg(arg)?;
    }
    Ok(filters)
}

pub(crate) async fn stack_services<E: EngineApi + ?Sized>(
    engine: &E,
    namespace: &str,
) -> Result<Vec<Service>> {
    engine
        .service_list(&ServiceListOptions {
            filters: stack_filter(namespace, &[])?,
            status: false,
        })
        .await
}

pub(crate) async fn stack_networks<E: EngineApi + ?Sized>(
    engine: &E,
    namespace: &str,
) -> Result<Vec<NetworkResource>> {
    engine.network_list(&stack_filter(namespace, &[])?).await
}

pub(crate) async fn stack_secrets<E: EngineApi + ?Sized>(
    engine: &E,
    namespace: &str,
) -> Result<Vec<Secret>> {
    engine.secret_list(&stack_filter(namespace, &[])?).await
}

pub(crate) async fn stack_configs<E: EngineApi + ?Sized>(
    engine: &E,
    namespace: &str,
) -> Result<Vec<Config>> {
    engine.config_list(&stack_filter(namespace, &[])?).await
}
