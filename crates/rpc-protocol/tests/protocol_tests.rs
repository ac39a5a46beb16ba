//! Protocol layer tests: envelope parsing, response codes, contexts.

#[cfg(test)]
mod tests {
    use rpc_protocol::*;
    use serde_json::json;

    // ─────────────────────────────────────────────────────────────────────
    // RequestEnvelope
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn request_parsed_from_wire_format() {
        let wire = r#"{"app":"Shop","class":"user","method":"get","sign":"ABC","args":{"id":7}}"#;
        let (req, raw) = RequestEnvelope::parse(wire).unwrap();
        assert_eq!(req.app.as_deref(), Some("Shop"));
        assert_eq!(req.class, "user");
        assert_eq!(req.method, "get");
        assert_eq!(req.sign(), Some("ABC"));
        assert_eq!(req.args()["id"], 7);
        assert_eq!(raw["args"]["id"], 7);
    }

    #[test]
    fn request_optional_fields_default() {
        let (req, _) = RequestEnvelope::parse(r#"{"class":"user","method":"list"}"#).unwrap();
        assert!(req.app.is_none());
        assert!(req.sign().is_none());
        assert!(req.args().is_empty());
    }

    #[test]
    fn request_null_args_is_empty() {
        let (req, _) =
            RequestEnvelope::parse(r#"{"class":"user","method":"list","args":null}"#).unwrap();
        assert!(req.args().is_empty());
    }

    #[test]
    fn request_missing_class_parses_to_empty() {
        let (req, _) = RequestEnvelope::parse(r#"{"method":"list"}"#).unwrap();
        assert_eq!(req.class, "");
    }

    #[test]
    fn request_unknown_fields_ignored() {
        let (req, raw) =
            RequestEnvelope::parse(r#"{"class":"a","method":"b","trace":"xyz"}"#).unwrap();
        assert_eq!(req.class, "a");
        assert_eq!(raw["trace"], "xyz");
    }

    #[test]
    fn request_string_payload_is_parameter_exception() {
        let err = RequestEnvelope::parse(r#""not-json-object""#).unwrap_err();
        assert_eq!(err, RpcError::parameter_exception());
    }

    #[test]
    fn request_array_payload_is_parameter_exception() {
        let err = RequestEnvelope::parse(r#"[{"class":"a","method":"b"}]"#).unwrap_err();
        assert_eq!(err.code, 404);
        assert_eq!(err.msg, "parameter exception");
    }

    #[test]
    fn request_invalid_json_is_parameter_exception() {
        let err = RequestEnvelope::parse("not-json-object").unwrap_err();
        assert_eq!(err, RpcError::parameter_exception());
    }

    #[test]
    fn request_non_object_args_is_parameter_exception() {
        let err =
            RequestEnvelope::parse(r#"{"class":"a","method":"b","args":[1,2]}"#).unwrap_err();
        assert_eq!(err, RpcError::parameter_exception());
    }

    #[test]
    fn request_non_string_sign_is_kept_for_verification() {
        let (req, raw) =
            RequestEnvelope::parse(r#"{"class":"a","method":"b","sign":123}"#).unwrap();
        assert_eq!(req.sign, Some(json!(123)));
        assert!(req.sign().is_none());
        assert_eq!(raw["sign"], 123);
    }

    #[test]
    fn request_scalar_app_is_taken_as_text() {
        let (req, _) = RequestEnvelope::parse(r#"{"app":2024,"class":"a","method":"b"}"#).unwrap();
        assert_eq!(req.app.as_deref(), Some("2024"));
        let (req, _) = RequestEnvelope::parse(r#"{"app":null,"class":"a","method":"b"}"#).unwrap();
        assert!(req.app.is_none());
    }

    #[test]
    fn request_structured_app_is_parameter_exception() {
        let err = RequestEnvelope::parse(r#"{"app":{"x":1},"class":"a","method":"b"}"#).unwrap_err();
        assert_eq!(err, RpcError::parameter_exception());
    }

    #[test]
    fn request_non_string_class_is_parameter_exception() {
        let err = RequestEnvelope::parse(r#"{"class":5,"method":"b"}"#).unwrap_err();
        assert_eq!(err, RpcError::parameter_exception());
    }

    // ─────────────────────────────────────────────────────────────────────
    // ResponseEnvelope
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn ok_response_wire_format() {
        let resp = ResponseEnvelope::ok(json!({"pong": true}));
        let parsed: serde_json::Value = serde_json::from_str(&resp.to_json()).unwrap();
        assert_eq!(parsed, json!({"code": 200, "msg": {"pong": true}}));
    }

    #[test]
    fn string_msg_response_wire_format() {
        let resp = ResponseEnvelope::new(422, "bad args");
        assert_eq!(resp.to_json(), r#"{"code":422,"msg":"bad args"}"#);
    }

    // ─────────────────────────────────────────────────────────────────────
    // RpcError
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn core_error_codes() {
        assert_eq!(RpcError::connection_not_permitted().code, 301);
        assert_eq!(RpcError::signature_failed().code, 401);
        assert_eq!(RpcError::class_not_found().code, 404);
        assert_eq!(RpcError::method_not_found().code, 404);
        assert_eq!(RpcError::logging_failure("disk full").code, 502);
    }

    #[test]
    fn gate_rejection_wire_format() {
        let json = RpcError::connection_not_permitted().into_response().to_json();
        assert_eq!(json, r#"{"code":301,"msg":"connection not permitted"}"#);
    }

    #[test]
    fn business_error_passes_code_through() {
        let err = RpcError::business(422, "bad args");
        let resp: ResponseEnvelope = err.into();
        assert_eq!(resp, ResponseEnvelope::new(422, "bad args"));
    }

    #[test]
    fn internal_error_carries_detail_fields() {
        let detail = ErrorDetail {
            code: 3,
            ..ErrorDetail::at("boom", "src/user.rs", 12)
        };
        let resp = RpcError::internal(detail).into_response();
        assert_eq!(resp.code, 500);
        assert_eq!(resp.msg["errMessage"], "boom");
        assert_eq!(resp.msg["errCode"], 3);
        assert_eq!(resp.msg["errFile"], "src/user.rs");
        assert_eq!(resp.msg["errLine"], 12);
    }

    #[test]
    fn infrastructure_error_is_501() {
        let resp = RpcError::infrastructure(ErrorDetail::here("chain broke")).into_response();
        assert_eq!(resp.code, 501);
        assert!(resp.msg["errFile"].as_str().unwrap().ends_with("protocol_tests.rs"));
        assert!(resp.msg["errLine"].as_u64().unwrap() > 0);
    }

    #[test]
    fn error_codes_map_to_wire_integers() {
        for (code, wire) in [
            (RpcErrorCode::ConnectionNotPermitted, 301),
            (RpcErrorCode::SignatureFailed, 401),
            (RpcErrorCode::NotFound, 404),
            (RpcErrorCode::Internal, 500),
            (RpcErrorCode::Infrastructure, 501),
            (RpcErrorCode::LoggingFailure, 502),
            (RpcErrorCode::Custom(418), 418),
        ] {
            assert_eq!(code.code(), wire);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Contexts and policy
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn connection_context_canonicalises_mapped_ipv4() {
        let peer: std::net::SocketAddr = "[::ffff:10.0.0.5]:4000".parse().unwrap();
        let ctx = ConnectionContext::from_peer("c1", peer);
        assert_eq!(ctx.remote_ip, "10.0.0.5");
        assert_eq!(ctx.peer(), "10.0.0.5:4000");
    }

    #[test]
    fn ip_policy_from_json_and_debug_redacts_secret() {
        let policy: IpPolicy = serde_json::from_value(json!({
            "allowed_ips": ["127.0.0.1"],
            "app_secret": "s3cr3t",
            "sign_exempt_ips": ["10.0.0.1"],
        }))
        .unwrap();
        assert!(policy.allows("127.0.0.1"));
        assert!(!policy.allows("10.0.0.2"));
        assert!(policy.is_sign_exempt("10.0.0.1"));
        assert!(!format!("{policy:?}").contains("s3cr3t"));
    }
}
