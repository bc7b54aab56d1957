//! Virtual hosts, contexts, and handler registration.
//!
//! A virtual host partitions the server's URL space; each host maps path
//! prefixes (contexts) to per-method handlers, and dispatch picks the
//! longest registered prefix of the request path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::request::Request;
use crate::response::Response;
use crate::util::parent_path;
use crate::{Error, Result};

/// The result of a handler invocation: either the handler produced the full
/// response itself, or it asks the engine to send a default response with
/// the given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler sent the response (headers and body) itself.
    Handled,
    /// The engine should send a default error response with this status.
    Status(u16),
}

/// A handler serving the content of resources within a context.
///
/// Handlers are invoked concurrently from different worker threads and must
/// be thread-safe. A handler that has already written anything into the
/// response must return `Outcome::Handled`.
pub trait ContextHandler: Send + Sync {
    fn serve(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<Outcome>;
}

impl<F> ContextHandler for F
where
    F: Fn(&mut Request<'_>, &mut Response<'_>) -> Result<Outcome> + Send + Sync,
{
    fn serve(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<Outcome> {
        self(req, resp)
    }
}

/// A context within a virtual host: a path prefix and the handlers of the
/// methods supported under it.
#[derive(Default)]
pub struct ContextInfo {
    path: String,
    handlers: HashMap<String, Arc<dyn ContextHandler>>,
}

impl ContextInfo {
    fn new(path: &str) -> Self {
        ContextInfo {
            path: path.to_string(),
            handlers: HashMap::new(),
        }
    }

    /// The context path, without a trailing slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The method-to-handler table of this context.
    pub fn handlers(&self) -> &HashMap<String, Arc<dyn ContextHandler>> {
        &self.handlers
    }

    /// Returns the handler registered for the given method.
    pub fn handler_for(&self, method: &str) -> Option<&Arc<dyn ContextHandler>> {
        self.handlers.get(method)
    }
}

/// A named (and aliased) partition of contexts under one server, selected by
/// the request's effective host name, with fall-through to a default host.
pub struct VirtualHost {
    name: Option<String>,
    aliases: Vec<String>,
    directory_index: Option<String>,
    allow_generated_index: bool,
    contexts: HashMap<String, ContextInfo>,
    methods: HashSet<String>,
    empty_context: ContextInfo,
}

impl VirtualHost {
    /// Creates a virtual host with the given name, or the default host if
    /// the name is None.
    pub fn new(name: Option<&str>) -> Self {
        VirtualHost {
            name: name.map(|n| n.to_string()),
            aliases: Vec::new(),
            directory_index: Some("index.html".to_string()),
            allow_generated_index: false,
            contexts: HashMap::new(),
            methods: HashSet::new(),
            empty_context: ContextInfo::default(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Adds an alias under which this host is also reachable.
    pub fn add_alias(&mut self, alias: &str) {
        self.aliases.push(alias.to_string());
    }

    /// The filename to look for when a directory path is requested, or None
    /// to disable welcome files.
    pub fn directory_index(&self) -> Option<&str> {
        self.directory_index.as_deref()
    }

    pub fn set_directory_index(&mut self, index: Option<&str>) {
        self.directory_index = index.map(|i| i.to_string());
    }

    /// Whether directories without a welcome file get a generated index page.
    pub fn allows_generated_index(&self) -> bool {
        self.allow_generated_index
    }

    pub fn set_allow_generated_index(&mut self, allow: bool) {
        self.allow_generated_index = allow;
    }

    /// All methods supported by any context of this host.
    pub fn methods(&self) -> &HashSet<String> {
        &self.methods
    }

    /// Registers a handler for the given path and methods. If no methods
    /// are given, GET is registered. HEAD is never registered: it is
    /// synthesized from the GET handler by the transaction engine.
    pub fn add_context(
        &mut self,
        path: &str,
        handler: Arc<dyn ContextHandler>,
        methods: &[&str],
    ) -> Result<()> {
        if !path.starts_with('/') && path != "*" {
            return Err(Error::Protocol(format!("invalid path: {}", path)));
        }
        let methods: &[&str] = if methods.is_empty() { &["GET"] } else { methods };
        // context paths are stored without a trailing slash
        let path = path.trim_end_matches('/');
        let info = self
            .contexts
            .entry(path.to_string())
            .or_insert_with(|| ContextInfo::new(path));
        for method in methods {
            info.handlers.insert(method.to_string(), handler.clone());
            self.methods.insert(method.to_string());
        }
        Ok(())
    }

    /// Registers a set of handlers declaratively, each entry giving the
    /// path, the supported methods and the handler.
    pub fn add_contexts(
        &mut self,
        entries: Vec<(&str, &[&str], Arc<dyn ContextHandler>)>,
    ) -> Result<()> {
        for (path, methods, handler) in entries {
            self.add_context(path, handler, methods)?;
        }
        Ok(())
    }

    /// Returns the context whose path is the longest registered prefix of
    /// the given path, or the empty context if none matches.
    pub fn context_for(&self, path: &str) -> &ContextInfo {
        let mut path = path.trim_end_matches('/').to_string();
        loop {
            if let Some(info) = self.contexts.get(&path) {
                return info;
            }
            match parent_path(&path) {
                Some(parent) => path = parent.to_string(),
                None => return &self.empty_context,
            }
        }
    }
}
