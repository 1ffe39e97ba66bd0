use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::types::Signature;

use super::params::Params;
use super::runner::RunResult;

pub type NativeFn = dyn Fn(&mut Params<'_, '_>) -> RunResult<()> + Send + Sync;

/// A host function or handler callable from bytecode.
#[derive(Clone)]
pub struct NativeCallback {
    signature: Signature,
    is_handler: bool,
    f: Arc<NativeFn>,
}

impl NativeCallback {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_handler(&self) -> bool {
        self.is_handler
    }

    pub(crate) fn invoke(&self, params: &mut Params<'_, '_>) -> RunResult<()> {
        (self.f)(params)
    }
}

impl fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCallback")
            .field("signature", &self.signature.to_string())
            .field("is_handler", &self.is_handler)
            .finish_non_exhaustive()
    }
}

/// Registry of native callbacks, keyed by signature. Functions and handlers
/// live in separate namespaces.
#[derive(Debug, Default, Clone)]
pub struct Runtime {
    functions: HashMap<Signature, NativeCallback>,
    handlers: HashMap<Signature, NativeCallback>,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime::default()
    }

    /// Registers a native function. Its result goes through `Params::set_result`.
    pub fn register_function(
        &mut self,
        signature: Signature,
        f: impl Fn(&mut Params<'_, '_>) -> RunResult<()> + Send + Sync + 'static,
    ) -> &mut Self {
        debug!(signature = %signature, "registered native function");
        let cb = NativeCallback { signature: signature.clone(), is_handler: false, f: Arc::new(f) };
        self.functions.insert(signature, cb);
        self
    }

    /// Registers a native handler. Setting a `true` result ends the run as handled.
    pub fn register_handler(
        &mut self,
        signature: Signature,
        f: impl Fn(&mut Params<'_, '_>) -> RunResult<()> + Send + Sync + 'static,
    ) -> &mut Self {
        debug!(signature = %signature, "registered native handler");
        let cb = NativeCallback { signature: signature.clone(), is_handler: true, f: Arc::new(f) };
        self.handlers.insert(signature, cb);
        self
    }

    pub fn find_function(&self, signature: &Signature) -> Option<&NativeCallback> {
        self.functions.get(signature)
    }

    pub fn find_handler(&self, signature: &Signature) -> Option<&NativeCallback> {
        self.handlers.get(signature)
    }

    /// Every registered signature, functions first.
    pub fn signatures(&self) -> impl Iterator<Item = &Signature> {
        self.functions.keys().chain(self.handlers.keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functions_and_handlers_are_separate() {
        let mut rt = Runtime::new();
        let sig: Signature = "check(S)B".parse().unwrap();
        rt.register_function(sig.clone(), |_| Ok(()));
        assert!(rt.find_function(&sig).is_some());
        assert!(rt.find_handler(&sig).is_none());

        rt.register_handler(sig.clone(), |_| Ok(()));
        let h = rt.find_handler(&sig).unwrap();
        assert!(h.is_handler());
        assert_eq!(h.signature(), &sig);
        assert_eq!(rt.signatures().count(), 2);
    }

    #[test]
    fn lookup_is_by_full_signature() {
        let mut rt = Runtime::new();
        rt.register_function("log(S)V".parse().unwrap(), |_| Ok(()));
        assert!(rt.find_function(&"log(I)V".parse().unwrap()).is_none());
        assert!(rt.find_function(&"log(S)V".parse().unwrap()).is_some());
    }
}
