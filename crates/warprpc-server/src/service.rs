//! Service implementations and how the dispatcher calls them.

use std::collections::HashMap;

use warprpc_common::{Result, RpcValue, WarprpcError};

/// A service implementation the dispatcher can invoke by method name.
///
/// `interfaces` names the service interfaces the implementation exposes.
/// A server only accepts implementations exposing exactly one, which becomes
/// the service name callers address.
///
/// `invoke` runs on the blocking pool, so it may block or compute for as
/// long as it needs. Returning `Err` or panicking turns into a failure
/// response for that call only.
pub trait RpcService: Send + Sync + 'static {
    fn interfaces(&self) -> Vec<String>;

    fn invoke(&self, method: &str, args: Vec<RpcValue>) -> Result<RpcValue>;
}

type Handler = Box<dyn Fn(Vec<RpcValue>) -> Result<RpcValue> + Send + Sync>;

/// [`RpcService`] assembled from closures, one per method.
///
/// # Example
///
/// ```
/// use warprpc_common::{RpcValue, WarprpcError};
/// use warprpc_server::{MethodTable, RpcService};
///
/// let calculator = MethodTable::new("Calculator").method("add", |args| {
///     let sum = args.iter().filter_map(RpcValue::as_i64).sum::<i64>();
///     Ok(RpcValue::Int(sum))
/// });
///
/// let result = calculator
///     .invoke("add", vec![RpcValue::Int(2), RpcValue::Int(3)])
///     .unwrap();
/// assert_eq!(result, RpcValue::Int(5));
/// ```
pub struct MethodTable {
    interface: String,
    methods: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            methods: HashMap::new(),
        }
    }

    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> Result<RpcValue> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(handler));
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl RpcService for MethodTable {
    fn interfaces(&self) -> Vec<String> {
        vec![self.interface.clone()]
    }

    fn invoke(&self, method: &str, args: Vec<RpcValue>) -> Result<RpcValue> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| WarprpcError::MethodNotFound {
                service: self.interface.clone(),
                method: method.to_string(),
            })?;
        handler(args)
    }
}

/// The built-in `Echo` service.
///
/// - `echo(x)` returns `x`
/// - `fail(message?)` fails with `message`
pub fn echo_service() -> MethodTable {
    MethodTable::new("Echo")
        .method("echo", |mut args| {
            if args.len() != 1 {
                return Err(WarprpcError::ArgumentMismatch(format!(
                    "echo takes 1 argument, got {}",
                    args.len()
                )));
            }
            Ok(args.remove(0))
        })
        .method("fail", |args| {
            let message = args
                .first()
                .and_then(RpcValue::as_str)
                .unwrap_or("requested failure");
            Err(WarprpcError::Invocation(message.to_string()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use warprpc_common::ErrorKind;

    #[test]
    fn test_echo_service() {
        let echo = echo_service();
        assert_eq!(echo.interfaces(), vec!["Echo".to_string()]);
        assert_eq!(echo.method_names(), vec!["echo", "fail"]);
        assert_eq!(
            echo.invoke("echo", vec![RpcValue::from("hello")]).unwrap(),
            RpcValue::from("hello")
        );
    }

    #[test]
    fn test_echo_arity() {
        let err = echo_service().invoke("echo", vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn test_fail_carries_message() {
        let err = echo_service()
            .invoke("fail", vec![RpcValue::from("boom")])
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_unknown_method() {
        let err = echo_service().invoke("shout", vec![]).unwrap_err();
        assert!(matches!(
            err,
            WarprpcError::MethodNotFound { ref service, ref method } if service == "Echo" && method == "shout"
        ));
    }
}
