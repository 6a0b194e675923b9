//! Per-application method registry.
//!
//! A [`Capability`] declares its callable methods through [`Exports`]; the
//! registry turns each export into a [`HandlerBinding`] that knows how to
//! build a request-scoped instance, decode and validate the parameter, and
//! encode the result. Registries are populated during startup and sealed
//! before serving begins.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use meshcall_core::envelope::encode_payload;
use meshcall_core::{CallContext, CallError, CallParam, ParamShape, ValidationErrors};
use serde::Serialize;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A set of methods exposed for registration.
///
/// The registered value acts as a factory: every call gets a fresh instance
/// from [`Capability::instantiate`], so handlers never share mutable state
/// across concurrent calls.
pub trait Capability: Send + Sync + Sized + 'static {
    /// Builds the instance that serves exactly one call.
    fn instantiate(&self, ctx: &CallContext) -> Self;

    /// Declares the callable methods. Anything not exported here stays a
    /// private helper.
    fn export(exports: &mut Exports<Self>);
}

/// Lower-cases the first character of a method name.
#[must_use]
pub fn first_lower(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn valid_method_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Future produced by a prepared call: resolves to the encoded result.
pub type CallFuture = BoxFuture<'static, Result<Bytes, CallError>>;

/// Why a payload never reached the handler.
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("{0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Validate(#[from] ValidationErrors),
}

/// Type-erased entry point of one bound method.
pub trait Invoke: Send + Sync {
    /// Decodes and validates `payload`, builds the request-scoped instance
    /// and returns the pending invocation.
    ///
    /// # Errors
    ///
    /// Returns [`PrepareError`] when the payload does not decode into the
    /// parameter type or fails validation.
    fn prepare(&self, ctx: &CallContext, payload: &[u8]) -> Result<CallFuture, PrepareError>;
}

struct MethodInvoker<C, P, F> {
    owner: Arc<C>,
    handler: Arc<F>,
    _param: PhantomData<fn(P)>,
}

impl<C, P, F, Fut, R> Invoke for MethodInvoker<C, P, F>
where
    C: Capability,
    P: CallParam,
    F: Fn(C, CallContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, CallError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn prepare(&self, ctx: &CallContext, payload: &[u8]) -> Result<CallFuture, PrepareError> {
        let param: P = serde_json::from_slice(payload)?;
        if P::SHAPE == ParamShape::Record {
            param.validate()?;
        }

        let instance = self.owner.instantiate(ctx);
        let fut = (self.handler)(instance, ctx.clone(), param);
        Ok(Box::pin(async move {
            let result = fut.await?;
            encode_payload(&result).map_err(CallError::internal)
        }))
    }
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

/// One method declared by a capability, before it lands in a registry.
struct Export {
    name: String,
    index: usize,
    param_type: &'static str,
    result_type: &'static str,
    shape: ParamShape,
    invoker: Arc<dyn Invoke>,
}

/// Collects the methods a [`Capability`] exposes.
pub struct Exports<C> {
    owner: Arc<C>,
    entries: Vec<Export>,
}

impl<C: Capability> Exports<C> {
    fn new(owner: Arc<C>) -> Self {
        Self {
            owner,
            entries: Vec::new(),
        }
    }

    /// Exports `handler` under `name` (first letter lower-cased).
    ///
    /// Names that are not plain identifiers are skipped. Exporting the same
    /// name twice keeps the later handler.
    pub fn method<P, R, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        P: CallParam,
        R: Serialize + Send + 'static,
        F: Fn(C, CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, CallError>> + Send + 'static,
    {
        let name = first_lower(name);
        if !valid_method_name(&name) {
            debug!(
                event = "registry",
                processor = "parse meta",
                owner = std::any::type_name::<C>(),
                method = %name,
                "skipping export with invalid method name"
            );
            return self;
        }

        let index = self.entries.len();
        let export = Export {
            name: name.clone(),
            index,
            param_type: std::any::type_name::<P>(),
            result_type: std::any::type_name::<R>(),
            shape: P::SHAPE,
            invoker: Arc::new(MethodInvoker {
                owner: Arc::clone(&self.owner),
                handler: Arc::new(handler),
                _param: PhantomData,
            }),
        };

        if let Some(existing) = self.entries.iter_mut().find(|e| e.name == name) {
            warn!(
                owner = std::any::type_name::<C>(),
                method = %name,
                "method exported twice, keeping the later handler"
            );
            *existing = Export { index: existing.index, ..export };
        } else {
            self.entries.push(export);
        }
        self
    }

    fn collect(capability: C) -> Vec<Export> {
        let mut exports = Self::new(Arc::new(capability));
        C::export(&mut exports);
        exports.entries
    }
}

// ---------------------------------------------------------------------------
// HandlerBinding
// ---------------------------------------------------------------------------

/// Registry entry mapping a method name to its executable implementation.
#[derive(Clone)]
pub struct HandlerBinding {
    pub name: String,
    /// Fully qualified parameter type.
    pub param_type: &'static str,
    pub result_type: &'static str,
    pub shape: ParamShape,
    /// Position of the method among its capability's exports.
    pub bound_index: usize,
    /// Fully qualified capability type.
    pub owner: &'static str,
    /// How many times the binding was replaced after its first registration.
    pub override_depth: u32,
    /// Log full request and response payloads.
    pub verbose: bool,
    /// Suppress per-call logging entirely.
    pub ignore_log: bool,
    invoker: Arc<dyn Invoke>,
}

impl HandlerBinding {
    fn from_export(export: Export, owner: &'static str) -> Self {
        Self {
            name: export.name,
            param_type: export.param_type,
            result_type: export.result_type,
            shape: export.shape,
            bound_index: export.index,
            owner,
            override_depth: 0,
            verbose: false,
            ignore_log: false,
            invoker: export.invoker,
        }
    }

    /// Returns the type-erased invoker for this binding.
    #[must_use]
    pub fn invoker(&self) -> &dyn Invoke {
        self.invoker.as_ref()
    }

    /// Returns true when two bindings dispatch to the same implementation.
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.invoker, &other.invoker)
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("name", &self.name)
            .field("param_type", &self.param_type)
            .field("result_type", &self.result_type)
            .field("shape", &self.shape)
            .field("bound_index", &self.bound_index)
            .field("owner", &self.owner)
            .field("override_depth", &self.override_depth)
            .field("verbose", &self.verbose)
            .field("ignore_log", &self.ignore_log)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// MethodRegistry
// ---------------------------------------------------------------------------

/// Startup-time registry configuration failures. These are fatal: the
/// process should refuse to start.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("method [{method}] of app [{app}] registered twice (by {existing} and {incoming})")]
    Duplicate {
        app: String,
        method: String,
        existing: &'static str,
        incoming: &'static str,
    },
    #[error("registry of app [{app}] is sealed")]
    Sealed { app: String },
    #[error("invalid app name [{app}]")]
    InvalidApp { app: String },
}

/// Method table of one application.
///
/// Mutated only during startup; [`MethodRegistry::seal`] freezes it, after
/// which every mutation fails with [`RegistryError::Sealed`] and lookups
/// need no synchronisation.
#[derive(Debug)]
pub struct MethodRegistry {
    app: String,
    bindings: HashMap<String, HandlerBinding>,
    sealed: bool,
}

impl MethodRegistry {
    #[must_use]
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            bindings: HashMap::new(),
            sealed: false,
        }
    }

    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.sealed {
            Err(RegistryError::Sealed {
                app: self.app.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Registers every method `capability` exports.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::Duplicate`] if any exported name is
    /// already bound; nothing is registered in that case.
    pub fn add<C: Capability>(&mut self, capability: C) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        let owner = std::any::type_name::<C>();
        let exports = Exports::collect(capability);

        if let Some(clash) = exports.iter().find(|e| self.bindings.contains_key(&e.name)) {
            return Err(RegistryError::Duplicate {
                app: self.app.clone(),
                method: clash.name.clone(),
                existing: self.bindings[&clash.name].owner,
                incoming: owner,
            });
        }

        for export in exports {
            info!(event = "registry", app = %self.app, method = %export.name, owner, "import");
            self.bindings
                .insert(export.name.clone(), HandlerBinding::from_export(export, owner));
        }
        Ok(self)
    }

    /// Registers every method `capability` exports, replacing existing
    /// bindings of the same name.
    ///
    /// # Errors
    ///
    /// Fails only when the registry is sealed.
    pub fn override_with<C: Capability>(
        &mut self,
        capability: C,
    ) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        let owner = std::any::type_name::<C>();
        for export in Exports::collect(capability) {
            self.replace(HandlerBinding::from_export(export, owner));
        }
        Ok(self)
    }

    /// Like [`MethodRegistry::override_with`], restricted to `methods`.
    /// Names the capability does not export are logged and ignored.
    ///
    /// # Errors
    ///
    /// Fails only when the registry is sealed.
    pub fn impact<C: Capability>(
        &mut self,
        capability: C,
        methods: &[&str],
    ) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        let owner = std::any::type_name::<C>();
        let mut exports: HashMap<String, Export> = Exports::collect(capability)
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        for method in methods {
            match exports.remove(*method) {
                Some(export) => self.replace(HandlerBinding::from_export(export, owner)),
                None => warn!(
                    event = "registry",
                    app = %self.app,
                    method,
                    owner,
                    "impact names a method the capability does not export"
                ),
            }
        }
        Ok(self)
    }

    fn replace(&mut self, mut binding: HandlerBinding) {
        match self.bindings.get(&binding.name) {
            Some(old) => {
                binding.override_depth = old.override_depth + 1;
                binding.verbose = old.verbose;
                binding.ignore_log = old.ignore_log;
                info!(
                    event = "registry",
                    app = %self.app,
                    method = %binding.name,
                    owner = binding.owner,
                    depth = binding.override_depth,
                    "override"
                );
            }
            None => {
                info!(
                    event = "registry",
                    app = %self.app,
                    method = %binding.name,
                    owner = binding.owner,
                    "import"
                );
            }
        }
        self.bindings.insert(binding.name.clone(), binding);
    }

    /// Removes bindings; the methods then resolve as not implemented.
    ///
    /// # Errors
    ///
    /// Fails only when the registry is sealed.
    pub fn forbid(&mut self, methods: &[&str]) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        for method in methods {
            if self.bindings.remove(*method).is_some() {
                info!(event = "registry", app = %self.app, method, "forbid");
            }
        }
        Ok(self)
    }

    /// Marks bindings whose payloads are logged in full.
    ///
    /// # Errors
    ///
    /// Fails only when the registry is sealed.
    pub fn set_verbose(&mut self, methods: &[&str]) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        for method in methods {
            if let Some(binding) = self.bindings.get_mut(*method) {
                binding.verbose = true;
            }
        }
        Ok(self)
    }

    /// Suppresses per-call logging for chatty methods.
    ///
    /// # Errors
    ///
    /// Fails only when the registry is sealed.
    pub fn ignore_log(&mut self, methods: &[&str]) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        for method in methods {
            if let Some(binding) = self.bindings.get_mut(*method) {
                binding.ignore_log = true;
            }
        }
        Ok(self)
    }

    /// Freezes the registry. Idempotent.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[must_use]
    pub fn lookup(&self, method: &str) -> Option<&HandlerBinding> {
        self.bindings.get(method)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bound method names, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }

    /// Splits the sorted method list into (imported, overridden).
    #[must_use]
    pub fn abstract_view(&self) -> (Vec<String>, Vec<String>) {
        self.methods()
            .into_iter()
            .partition(|name| self.bindings[name].override_depth == 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
