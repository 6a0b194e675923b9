//! The protocol-neutral call envelope.
//!
//! `Request { app, method, param }` goes in, `Response { code, msg, data }`
//! comes out, whether the call is served in-process or by a peer. On the peer
//! wire both byte fields travel as base64 strings inside JSON; towards HTTP
//! clients the response is re-wrapped as a [`FinalResponse`] whose `data` is
//! embedded as raw JSON.
//!
//! `Response::data` is never empty: "no data" is always the `{}` sentinel so
//! callers can decode it unconditionally.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::code::{self, Code};

/// Sentinel payload for "no object".
pub const NULL_JSON: &[u8] = b"{}";
/// Sentinel payload for "no list".
pub const NULL_LIST: &[u8] = b"[]";

/// Replaces empty or `null` payloads with the `{}` sentinel.
#[must_use]
pub fn ensure_json(raw: Bytes) -> Bytes {
    if raw.is_empty() || raw.as_ref() == b"null" {
        Bytes::from_static(NULL_JSON)
    } else {
        raw
    }
}

/// Serialises a value for a response payload, falling back to the sentinel.
///
/// # Errors
///
/// Returns the serialiser error when `value` cannot be encoded as JSON.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(value).map(|raw| ensure_json(Bytes::from(raw)))
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One callable unit: the target app, the method name and an opaque argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    app: String,
    method: String,
    #[serde(default, with = "base64_bytes")]
    param: Bytes,
}

impl Request {
    /// Builds a request from already-serialised parameter bytes.
    pub fn new(app: impl Into<String>, method: impl Into<String>, param: impl Into<Bytes>) -> Self {
        Self {
            app: app.into(),
            method: method.into(),
            param: param.into(),
        }
    }

    /// Builds a request by serialising a typed argument as JSON.
    ///
    /// # Errors
    ///
    /// Returns the serialiser error when `param` cannot be encoded.
    pub fn encode<T: Serialize + ?Sized>(
        app: impl Into<String>,
        method: impl Into<String>,
        param: &T,
    ) -> Result<Self, serde_json::Error> {
        let raw = serde_json::to_vec(param)?;
        Ok(Self::new(app, method, raw))
    }

    #[must_use]
    pub fn app(&self) -> &str {
        &self.app
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw parameter bytes exactly as received.
    #[must_use]
    pub fn param(&self) -> &Bytes {
        &self.param
    }

    /// Parameter bytes to decode: an empty param decodes as `{}`.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        if self.param.is_empty() {
            Bytes::from_static(NULL_JSON)
        } else {
            self.param.clone()
        }
    }

    /// Returns a copy addressed to a different app and method, same param.
    #[must_use]
    pub fn redirect(&self, app: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(app, method, self.param.clone())
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Outcome of a call: a taxonomy code, a human message and a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ResponseWire")]
pub struct Response {
    code: Code,
    msg: String,
    #[serde(with = "base64_bytes")]
    data: Bytes,
}

/// Deserialisation shape; conversion restores the sentinel invariant.
#[derive(Deserialize)]
struct ResponseWire {
    #[serde(default)]
    code: Code,
    #[serde(default)]
    msg: String,
    #[serde(default, with = "base64_bytes")]
    data: Bytes,
}

impl From<ResponseWire> for Response {
    fn from(wire: ResponseWire) -> Self {
        Self::new(wire.code, wire.msg, wire.data)
    }
}

impl Response {
    /// Builds a response; empty or `null` data becomes `{}`.
    pub fn new(code: Code, msg: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: ensure_json(data.into()),
        }
    }

    /// A response without data.
    pub fn empty(code: Code, msg: impl Into<String>) -> Self {
        Self::new(code, msg, Bytes::from_static(NULL_JSON))
    }

    /// A successful response carrying already-encoded data.
    pub fn success(data: impl Into<Bytes>) -> Self {
        Self::new(code::OK, code::MSG_SUCCESS, data)
    }

    /// `UNIMPLEMENTED` for an app with no local or remote binding.
    #[must_use]
    pub fn app_not_implemented(app: &str) -> Self {
        Self::empty(code::UNIMPLEMENTED, format!("app [{app}] not implemented"))
    }

    /// `UNIMPLEMENTED` for a method missing from a registered app.
    #[must_use]
    pub fn method_not_implemented(method: &str) -> Self {
        Self::empty(code::UNIMPLEMENTED, format!("method [{method}] not implemented"))
    }

    /// `NOT_FOUND` for an app the service directory cannot resolve.
    #[must_use]
    pub fn app_not_found(app: &str) -> Self {
        Self::empty(code::NOT_FOUND, format!("app [{app}] not implemented"))
    }

    /// `DEADLINE_EXCEEDED` for a call that ran out of time.
    #[must_use]
    pub fn timeout(target: &str) -> Self {
        Self::empty(code::DEADLINE_EXCEEDED, format!("call [{target}] timeout"))
    }

    /// `INTERNAL` for a call that failed without a usable result.
    #[must_use]
    pub fn call_failed(target: &str) -> Self {
        Self::empty(code::INTERNAL, format!("call [{target}] failed"))
    }

    /// A rejected request with a caller-chosen code.
    #[must_use]
    pub fn bad_request(code: Code) -> Self {
        Self::empty(code, "BadRequest")
    }

    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    #[must_use]
    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// Payload bytes, never empty.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }

    /// Decodes the payload into a typed result.
    ///
    /// # Errors
    ///
    /// Returns the deserialiser error when the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Compact single-line JSON rendering for logs. A payload that is not
    /// JSON is rendered as a string.
    #[must_use]
    pub fn dump(&self) -> String {
        let data = serde_json::from_slice::<serde_json::Value>(&self.data).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.data).into_owned())
        });
        serde_json::json!({
            "code": self.code,
            "msg": self.msg,
            "data": data,
        })
        .to_string()
    }
}

// ---------------------------------------------------------------------------
// FinalResponse
// ---------------------------------------------------------------------------

/// The outer `{code, msg, data}` object returned to HTTP clients.
///
/// Unlike the peer wire form, `data` is embedded as raw JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalResponse {
    pub code: Code,
    pub msg: String,
    data: Bytes,
}

impl FinalResponse {
    /// A final response from a code, message and a serialisable value.
    ///
    /// # Errors
    ///
    /// Returns the serialiser error when `data` cannot be encoded.
    pub fn dump<T: Serialize + ?Sized>(
        code: Code,
        msg: impl Into<String>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            code,
            msg: msg.into(),
            data: encode_payload(data)?,
        })
    }

    /// Raw JSON payload bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl From<Response> for FinalResponse {
    fn from(rsp: Response) -> Self {
        // Payloads that are not JSON cannot be embedded; the sentinel stands in.
        let data = if serde_json::from_slice::<&RawValue>(&rsp.data).is_ok() {
            rsp.data
        } else {
            Bytes::from_static(NULL_JSON)
        };
        Self {
            code: rsp.code,
            msg: rsp.msg,
            data,
        }
    }
}

impl Serialize for FinalResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data: &RawValue =
            serde_json::from_slice(&self.data).map_err(serde::ser::Error::custom)?;
        let mut state = serializer.serialize_struct("FinalResponse", 3)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("msg", &self.msg)?;
        state.serialize_field("data", data)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for FinalResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            code: Code,
            #[serde(default)]
            msg: String,
            data: Option<Box<RawValue>>,
        }

        let wire = Wire::deserialize(deserializer)?;
        let data = wire
            .data
            .map(|raw| Bytes::from(raw.get().to_owned()))
            .unwrap_or_default();
        Ok(Self {
            code: wire.code,
            msg: wire.msg,
            data: ensure_json(data),
        })
    }
}

// ---------------------------------------------------------------------------
// base64 field codec
// ---------------------------------------------------------------------------

mod base64_bytes {
    use super::{Bytes, Deserialize, Deserializer, Engine, Serializer, STANDARD};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
            None => Ok(Bytes::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_param_decodes_as_null_json() {
        let req = Request::new("x", "ping", Bytes::new());
        assert_eq!(req.payload().as_ref(), NULL_JSON);
        assert!(req.param().is_empty());
    }

    #[test]
    fn encode_serialises_typed_param() {
        let req = Request::encode("x", "add", &json!({"a": 1})).unwrap();
        assert_eq!(req.param().as_ref(), br#"{"a":1}"#);
    }

    #[test]
    fn null_data_is_replaced_by_sentinel() {
        let rsp = Response::new(0, "success", Bytes::from_static(b"null"));
        assert_eq!(rsp.data().as_ref(), NULL_JSON);
    }

    #[test]
    fn list_data_is_kept() {
        let rsp = Response::success(Bytes::from_static(NULL_LIST));
        assert_eq!(rsp.data().as_ref(), NULL_LIST);
        assert_eq!(rsp.decode::<Vec<u32>>().unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn wire_form_uses_base64() {
        let req = Request::new("x", "ping", Bytes::from_static(b"{}"));
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire, json!({"app": "x", "method": "ping", "param": "e30="}));

        let back: Request = serde_json::from_value(wire).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn response_without_data_field_gets_sentinel() {
        let rsp: Response = serde_json::from_str(r#"{"code": -12, "msg": "nope"}"#).unwrap();
        assert_eq!(rsp.code(), crate::code::UNIMPLEMENTED);
        assert_eq!(rsp.data().as_ref(), NULL_JSON);
    }

    #[test]
    fn final_response_embeds_raw_json() {
        let rsp = Response::success(Bytes::from_static(br#"{"ok":true}"#));
        let body = serde_json::to_value(FinalResponse::from(rsp)).unwrap();
        assert_eq!(body, json!({"code": 0, "msg": "success", "data": {"ok": true}}));
    }

    #[test]
    fn final_response_replaces_non_json_data() {
        let rsp = Response::new(-1, "odd", Bytes::from_static(b"\xff\xfe"));
        let body = serde_json::to_value(FinalResponse::from(rsp)).unwrap();
        assert_eq!(body["data"], json!({}));
    }

    #[test]
    fn canned_messages() {
        assert_eq!(Response::app_not_implemented("x").msg(), "app [x] not implemented");
        assert_eq!(Response::method_not_implemented("m").msg(), "method [m] not implemented");
        assert_eq!(Response::timeout("x").code(), crate::code::DEADLINE_EXCEEDED);
        assert_eq!(Response::call_failed("x").msg(), "call [x] failed");
    }

    #[test]
    fn dump_is_valid_json_with_quoted_msg() {
        let rsp = Response::new(-1, r#"bad "sku" \ line"#, r#"{"left":2}"#);
        let dumped: serde_json::Value = serde_json::from_str(&rsp.dump()).unwrap();
        assert_eq!(dumped, json!({"code": -1, "msg": r#"bad "sku" \ line"#, "data": {"left": 2}}));

        let raw = Response::new(0, "ok", "not json");
        let dumped: serde_json::Value = serde_json::from_str(&raw.dump()).unwrap();
        assert_eq!(dumped["data"], "not json");
    }

    proptest! {
        #[test]
        fn data_is_never_empty_or_null(
            code in any::<i32>(),
            raw in prop::option::of("[a-z{}\\[\\]0-9]{0,8}"),
        ) {
            let data = raw.map(Bytes::from).unwrap_or_default();
            let rsp = Response::new(code, "m", data);
            prop_assert!(!rsp.data().is_empty());
            prop_assert_ne!(rsp.data().as_ref(), b"null");
        }

        #[test]
        fn dataless_responses_decode_to_empty_object(code in any::<i32>(), msg in ".{0,16}") {
            let rsp = Response::empty(code, msg);
            let value: serde_json::Value = rsp.decode().unwrap();
            prop_assert_eq!(value, json!({}));

            let wire = serde_json::to_string(&rsp).unwrap();
            let back: Response = serde_json::from_str(&wire).unwrap();
            prop_assert_eq!(back.data().as_ref(), NULL_JSON);
        }
    }
}
