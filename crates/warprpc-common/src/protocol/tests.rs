//! Tests for the protocol module
//!
//! These tests cover request construction, id generation, argument
//! descriptors and the response outcome contract.

#[cfg(test)]
mod tests {
    use super::super::*;
    use std::collections::{BTreeMap, HashSet};

    #[test]
    fn test_request_creation() {
        let req = Request::new(1, "Echo", "echo", vec![RpcValue::from("hello")]);
        assert_eq!(req.id, 1);
        assert_eq!(req.service, "Echo");
        assert_eq!(req.method, "echo");
        assert_eq!(req.arg_types, vec!["string".to_string()]);
    }

    #[test]
    fn test_request_arg_types_follow_args() {
        let req = Request::new(
            2,
            "Calc",
            "mix",
            vec![
                RpcValue::Int(1),
                RpcValue::Bool(true),
                RpcValue::Null,
                RpcValue::List(vec![]),
                RpcValue::Map(BTreeMap::new()),
            ],
        );
        assert_eq!(req.arg_types, vec!["int", "bool", "null", "list", "map"]);
        assert!(req.validate_args().is_ok());
    }

    #[test]
    fn test_validate_args_rejects_mismatch() {
        let mut req = Request::new(3, "Calc", "add", vec![RpcValue::Int(1), RpcValue::Int(2)]);
        req.arg_types[1] = "string".to_string();
        let err = req.validate_args().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn test_validate_args_rejects_count_mismatch() {
        let mut req = Request::new(4, "Calc", "add", vec![RpcValue::Int(1)]);
        req.arg_types.clear();
        assert!(req.validate_args().is_err());
    }

    #[test]
    fn test_id_generator_uniqueness() {
        let ids = IdGenerator::new();
        let seen: HashSet<_> = (0..1000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 1000, "All request IDs should be unique");
    }

    #[test]
    fn test_id_generator_uniqueness_under_stress() {
        use std::sync::{Arc, Mutex};
        use std::thread;

        let generator = Arc::new(IdGenerator::new());
        let ids = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = vec![];

        for _ in 0..10 {
            let generator = Arc::clone(&generator);
            let ids = Arc::clone(&ids);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let id = generator.next_id();
                    assert!(ids.lock().unwrap().insert(id), "Duplicate ID detected: {}", id);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ids.lock().unwrap().len(), 10_000);
    }

    #[test]
    fn test_id_generator_starts_at_one() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_response_success() {
        let resp = Response::success(123, RpcValue::from("ok"));
        assert!(resp.is_success());
        assert_eq!(resp.id, 123);
        assert_eq!(resp.into_result().unwrap(), RpcValue::from("ok"));
    }

    #[test]
    fn test_response_error() {
        let resp = Response::error(456, ErrorKind::Dispatch, "something failed");
        assert!(!resp.is_success());
        assert_eq!(resp.id, 456);
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dispatch);
        assert!(err.to_string().contains("something failed"));
    }

    #[test]
    fn test_response_error_kind_survives_round_trip() {
        let kinds = [
            ErrorKind::Configuration,
            ErrorKind::Protocol,
            ErrorKind::Serialization,
            ErrorKind::Dispatch,
            ErrorKind::Registry,
            ErrorKind::Timeout,
            ErrorKind::NoProvider,
            ErrorKind::Connection,
        ];
        for kind in kinds {
            let err = Response::error(1, kind, "upstream said no")
                .into_result()
                .unwrap_err();
            assert_eq!(err.kind(), kind);
            assert!(err.to_string().contains("upstream said no"));
        }

        let timed_out = Response::from_error(2, &WarprpcError::Timeout(250));
        let err = timed_out.into_result().unwrap_err();
        assert!(matches!(err, WarprpcError::RemoteTimeout(ref m) if m.contains("250ms")));
    }

    #[test]
    fn test_response_from_error_keeps_kind() {
        let err = WarprpcError::ServiceNotFound("Missing".to_string());
        let resp = Response::from_error(9, &err);
        match &resp.outcome {
            Outcome::Failure(failure) => {
                assert_eq!(failure.kind, ErrorKind::Dispatch);
                assert!(failure.message.contains("Missing"));
            }
            Outcome::Success(_) => panic!("expected failure outcome"),
        }
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(WarprpcError::Config("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(
            WarprpcError::BadMagic { expected: 1, found: 2 }.kind(),
            ErrorKind::Protocol
        );
        assert_eq!(WarprpcError::Timeout(10).kind(), ErrorKind::Timeout);
        assert_eq!(WarprpcError::NoProvider("Echo".into()).kind(), ErrorKind::NoProvider);
        assert!(WarprpcError::ConnectionLost("gone".into()).is_connection_fatal());
        assert!(!WarprpcError::Invocation("boom".into()).is_connection_fatal());
    }

    #[test]
    fn test_value_json_conversion() {
        let json = serde_json::json!({"name": "warp", "count": 3, "tags": ["a", "b"], "ratio": 0.5});
        let value = RpcValue::from(json.clone());
        assert_eq!(serde_json::Value::from(value), json);
    }
}
