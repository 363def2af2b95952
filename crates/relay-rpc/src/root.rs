//! Capability resolution.
//!
//! A [`Root`] maps `(type, version, action)` to a [`MethodCaller`]. [`Registry`] is the standard
//! implementation: an explicit table of facades, each registered under an exact version with an
//! object factory and a [`MethodTable`].
//!
//! Method sets are exact per version. To derive a new version from an old one, clone the old
//! table (entries are shared by reference), then add, replace or drop methods:
//!
//! ```ignore
//! let v1 = MethodTable::new().method("Status", status).method("Deploy", deploy_v1);
//! let v2 = v1.clone().without("Deploy").method("DeployMany", deploy_many);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use relay_proto::{decode_body, encode_body, Body};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ApplicationError, CallError, NotImplementedError};
use crate::CallContext;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Why a [`Root`] could not produce a caller.
#[derive(Debug)]
pub enum ResolveError {
    /// The API surface does not exist. Reported to the peer as-is.
    NotImplemented(NotImplementedError),
    /// Any other failure. Passed through the connection's error transformer.
    Application(ApplicationError),
}

impl From<NotImplementedError> for ResolveError {
    fn from(err: NotImplementedError) -> Self {
        ResolveError::NotImplemented(err)
    }
}

impl From<ApplicationError> for ResolveError {
    fn from(err: ApplicationError) -> Self {
        ResolveError::Application(err)
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::NotImplemented(err) => fmt::Display::fmt(err, f),
            ResolveError::Application(err) => fmt::Display::fmt(err, f),
        }
    }
}

/// A resolved, invocable binding of one action.
pub trait MethodCaller: Send + Sync {
    /// Name of the parameter type, for introspection.
    fn params_type(&self) -> &'static str;

    /// Name of the result type, for introspection.
    fn result_type(&self) -> &'static str;

    /// Decodes `params`, resolves `object_id` and runs the action.
    ///
    /// Parameters must be decoded before the object is resolved, so a malformed body never
    /// reaches the object factory.
    fn call(
        &self,
        ctx: CallContext,
        object_id: String,
        params: Body,
    ) -> BoxFuture<Result<Body, CallError>>;
}

/// The capability set a connection dispatches against.
pub trait Root: Send + Sync + 'static {
    fn find_method(
        &self,
        type_name: &str,
        version: i64,
        action: &str,
    ) -> Result<Arc<dyn MethodCaller>, ResolveError>;

    /// Called once when the serving connection closes, after every dispatch has finished.
    fn kill(&self) {}
}

/// Resolves an object id to a facade instance.
pub type ObjectFactory<T> =
    Arc<dyn Fn(&str) -> Result<Arc<T>, ApplicationError> + Send + Sync + 'static>;

type Invocation<T> = Box<dyn FnOnce(Arc<T>, CallContext) -> BoxFuture<Result<Body, CallError>> + Send>;

struct MethodEntry<T> {
    params_type: &'static str,
    result_type: &'static str,
    /// Decodes the parameters and returns the invocation bound to them.
    bind: Box<dyn Fn(Body) -> Result<Invocation<T>, CallError> + Send + Sync>,
}

/// The exact set of actions one facade version exposes.
pub struct MethodTable<T> {
    methods: BTreeMap<String, Arc<MethodEntry<T>>>,
}

impl<T> Clone for MethodTable<T> {
    fn clone(&self) -> Self {
        Self {
            methods: self.methods.clone(),
        }
    }
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        Self {
            methods: BTreeMap::new(),
        }
    }
}

impl<T> fmt::Debug for MethodTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

impl<T: Send + Sync + 'static> MethodTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an action.
    ///
    /// An absent parameter body decodes as the zero value of `P` when `P` accepts an empty
    /// object; extra fields are ignored.
    pub fn method<P, R, F, Fut>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ApplicationError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let bind = move |params: Body| -> Result<Invocation<T>, CallError> {
            let params: P = decode_body(params).map_err(|err| CallError::Decode {
                message: err.to_string(),
            })?;
            let handler = handler.clone();
            Ok(Box::new(move |object: Arc<T>, ctx: CallContext| {
                let fut = handler(object, ctx, params);
                Box::pin(async move {
                    let result = fut.await?;
                    encode_body(&result).map_err(|err| CallError::Encode {
                        message: err.to_string(),
                    })
                }) as BoxFuture<_>
            }))
        };
        self.methods.insert(
            action.into(),
            Arc::new(MethodEntry {
                params_type: std::any::type_name::<P>(),
                result_type: std::any::type_name::<R>(),
                bind: Box::new(bind),
            }),
        );
        self
    }

    pub fn without(mut self, action: &str) -> Self {
        self.methods.remove(action);
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.methods.contains_key(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Binds `action` to objects produced by `factory`.
    pub fn bind(&self, action: &str, factory: ObjectFactory<T>) -> Option<Arc<dyn MethodCaller>> {
        let entry = self.methods.get(action)?.clone();
        Some(Arc::new(TableCaller { entry, factory }))
    }
}

struct TableCaller<T> {
    entry: Arc<MethodEntry<T>>,
    factory: ObjectFactory<T>,
}

impl<T: Send + Sync + 'static> MethodCaller for TableCaller<T> {
    fn params_type(&self) -> &'static str {
        self.entry.params_type
    }

    fn result_type(&self) -> &'static str {
        self.entry.result_type
    }

    fn call(
        &self,
        ctx: CallContext,
        object_id: String,
        params: Body,
    ) -> BoxFuture<Result<Body, CallError>> {
        let invocation = match (self.entry.bind)(params) {
            Ok(invocation) => invocation,
            Err(err) => return Box::pin(std::future::ready(Err(err))),
        };
        let factory = self.factory.clone();
        Box::pin(async move {
            let object = factory(&object_id)?;
            invocation(object, ctx).await
        })
    }
}

trait Facade: Send + Sync {
    fn bind(&self, action: &str) -> Option<Arc<dyn MethodCaller>>;
    fn actions(&self) -> Vec<String>;
}

struct TypedFacade<T> {
    factory: ObjectFactory<T>,
    table: MethodTable<T>,
}

impl<T: Send + Sync + 'static> Facade for TypedFacade<T> {
    fn bind(&self, action: &str) -> Option<Arc<dyn MethodCaller>> {
        self.table.bind(action, self.factory.clone())
    }

    fn actions(&self) -> Vec<String> {
        self.table.actions().map(str::to_owned).collect()
    }
}

type Facades = BTreeMap<String, BTreeMap<i64, Arc<dyn Facade>>>;

/// A [`Root`] built from explicit per-version method tables.
///
/// Cloning is cheap; clones share their facades and kill hook.
#[derive(Clone)]
pub struct Registry {
    facades: Arc<Facades>,
    on_kill: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.facades.keys().map(String::as_str)
    }

    pub fn versions(&self, type_name: &str) -> Vec<i64> {
        self.facades
            .get(type_name)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn actions(&self, type_name: &str, version: i64) -> Option<Vec<String>> {
        let facade = self.facades.get(type_name)?.get(&version)?;
        Some(facade.actions())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (type_name, versions) in self.facades.iter() {
            map.entry(type_name, &versions.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}

impl Root for Registry {
    fn find_method(
        &self,
        type_name: &str,
        version: i64,
        action: &str,
    ) -> Result<Arc<dyn MethodCaller>, ResolveError> {
        let versions =
            self.facades
                .get(type_name)
                .ok_or_else(|| NotImplementedError::UnknownType {
                    type_name: type_name.to_owned(),
                })?;
        let facade = versions
            .get(&version)
            .ok_or_else(|| NotImplementedError::UnknownVersion {
                type_name: type_name.to_owned(),
                version,
            })?;
        let caller = facade
            .bind(action)
            .ok_or_else(|| NotImplementedError::UnknownMethod {
                type_name: type_name.to_owned(),
                version,
                action: action.to_owned(),
            })?;
        Ok(caller)
    }

    fn kill(&self) {
        if let Some(on_kill) = &self.on_kill {
            on_kill();
        }
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    facades: Facades,
    on_kill: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl RegistryBuilder {
    /// Registers `table` as version `version` of `type_name`. A later registration of the same
    /// pair replaces the earlier one.
    pub fn register<T, F>(
        mut self,
        type_name: impl Into<String>,
        version: i64,
        factory: F,
        table: MethodTable<T>,
    ) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&str) -> Result<Arc<T>, ApplicationError> + Send + Sync + 'static,
    {
        let facade = TypedFacade {
            factory: Arc::new(factory) as ObjectFactory<T>,
            table,
        };
        self.facades
            .entry(type_name.into())
            .or_default()
            .insert(version, Arc::new(facade));
        self
    }

    /// Runs `hook` when a connection serving the registry closes.
    pub fn on_kill<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_kill = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            facades: Arc::new(self.facades),
            on_kill: self.on_kill,
        }
    }
}
