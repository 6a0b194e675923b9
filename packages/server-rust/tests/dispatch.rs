//! Dispatch behaviour through the public API: registration rules, the
//! executor's error mapping and fault isolation.

use std::sync::Arc;

use meshcall_core::code::{FAILED_PRECONDITION, INTERNAL, INVALID_ARGUMENT, OK, UNIMPLEMENTED};
use meshcall_core::{
    BusinessError, CallContext, CallError, CallParam, Empty, Request, ValidationErrors, Validator,
};
use meshcall_server::service::{
    Capability, Dispatcher, DispatcherBuilder, Exports, InstrumentMode, MethodRegistry,
    RegistryError,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct Pong {
    ok: bool,
}

#[derive(Deserialize)]
struct Transfer {
    account: String,
    amount: i64,
}

impl CallParam for Transfer {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .required("account", &self.account)
            .range("amount", self.amount, 1, 1_000)
            .finish()
    }
}

#[derive(Clone)]
struct Bank;

impl Capability for Bank {
    fn instantiate(&self, _ctx: &CallContext) -> Self {
        Bank
    }

    fn export(exports: &mut Exports<Self>) {
        exports
            .method("Ping", |_me: Bank, _ctx, _: Empty| async move {
                Ok::<_, CallError>(Pong { ok: true })
            })
            .method("transfer", |_me: Bank, _ctx, t: Transfer| async move {
                if t.account == "frozen" {
                    return Err(BusinessError::with_code(-1001, "account frozen").into());
                }
                Ok::<_, CallError>(Pong { ok: true })
            })
            .method("crash", |_me: Bank, _ctx, _: Empty| async move { crash() });
    }
}

fn crash() -> Result<Pong, CallError> {
    panic!("ledger corrupted")
}

/// Same method names as `Bank`, different answers.
#[derive(Clone)]
struct Audited;

impl Capability for Audited {
    fn instantiate(&self, _ctx: &CallContext) -> Self {
        Audited
    }

    fn export(exports: &mut Exports<Self>) {
        exports.method("ping", |_me: Audited, _ctx, _: Empty| async move {
            Ok::<_, CallError>(Pong { ok: false })
        });
    }
}

fn bank(mode: InstrumentMode) -> Dispatcher {
    let mut builder = DispatcherBuilder::new(mode);
    builder.add("x", Bank).unwrap();
    builder.build()
}

async fn call(dispatcher: &Dispatcher, method: &str, param: &str) -> meshcall_core::Response {
    dispatcher
        .call(CallContext::new(), Request::new("x", method, param.to_string()))
        .await
}

#[tokio::test]
async fn ping_succeeds() {
    let rsp = call(&bank(InstrumentMode::Dev), "ping", "{}").await;
    assert_eq!(rsp.code(), OK);
    assert_eq!(rsp.msg(), "success");
    assert_eq!(rsp.data().as_ref(), br#"{"ok":true}"#);
}

#[tokio::test]
async fn missing_method_is_unimplemented() {
    let rsp = call(&bank(InstrumentMode::Dev), "missing", "{}").await;
    assert_eq!(rsp.code(), UNIMPLEMENTED);
    assert_eq!(rsp.data().as_ref(), b"{}");
}

#[tokio::test]
async fn malformed_payload_is_invalid_argument() {
    let dev = call(&bank(InstrumentMode::Dev), "transfer", "{").await;
    assert_eq!(dev.code(), INVALID_ARGUMENT);

    let release = call(&bank(InstrumentMode::Release), "transfer", "{").await;
    assert_eq!(release.code(), INVALID_ARGUMENT);
    assert!(dev.msg().contains("line"), "dev shows decoder detail: {}", dev.msg());
    assert!(!release.msg().contains("line"), "release hides decoder detail: {}", release.msg());
}

#[tokio::test]
async fn validation_failure_is_failed_precondition() {
    let payload = r#"{"account":"a-1","amount":5000}"#;
    let rsp = call(&bank(InstrumentMode::Dev), "transfer", payload).await;
    assert_eq!(rsp.code(), FAILED_PRECONDITION);
    assert!(rsp.msg().contains("amount"));
}

#[tokio::test]
async fn business_error_keeps_its_code() {
    let payload = r#"{"account":"frozen","amount":10}"#;
    let rsp = call(&bank(InstrumentMode::Dev), "transfer", payload).await;
    assert_eq!(rsp.code(), -1001);
    assert_eq!(rsp.msg(), "account frozen");
}

#[tokio::test]
async fn forbidden_method_is_unimplemented() {
    let mut builder = DispatcherBuilder::new(InstrumentMode::Dev);
    builder.add("x", Bank).unwrap().forbid("x", &["ping"]).unwrap();
    let dispatcher = builder.build();

    let rsp = call(&dispatcher, "ping", "{}").await;
    assert_eq!(rsp.code(), UNIMPLEMENTED);
    assert!(call(&dispatcher, "transfer", r#"{"account":"a","amount":1}"#).await.is_ok());
}

#[tokio::test]
async fn panicking_handler_is_isolated() {
    let dispatcher = Arc::new(bank(InstrumentMode::Release));

    let crashes: Vec<_> = (0..8)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { call(&dispatcher, "crash", "{}").await })
        })
        .collect();
    let pings: Vec<_> = (0..8)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { call(&dispatcher, "ping", "{}").await })
        })
        .collect();

    for handle in crashes {
        let rsp = handle.await.unwrap();
        assert_eq!(rsp.code(), INTERNAL);
        assert!(!rsp.msg().contains("ledger"), "release mode must not leak panic text");
    }
    for handle in pings {
        assert!(handle.await.unwrap().is_ok());
    }
}

#[test]
fn override_takes_precedence() {
    let mut registry = MethodRegistry::new("x");
    registry.add(Bank).unwrap().override_with(Audited).unwrap();
    let binding = registry.lookup("ping").unwrap();
    assert_eq!(binding.override_depth, 1);
    assert!(binding.owner.ends_with("Audited"));
}

#[test]
fn duplicate_add_is_rejected() {
    let mut registry = MethodRegistry::new("x");
    registry.add(Bank).unwrap();
    let err = registry.add(Audited).unwrap_err();
    assert!(matches!(err, RegistryError::Duplicate { ref method, .. } if method == "ping"));
}

#[test]
fn sealed_registry_rejects_mutation() {
    let mut registry = MethodRegistry::new("x");
    registry.add(Bank).unwrap();
    registry.seal();
    assert!(matches!(registry.forbid(&["ping"]), Err(RegistryError::Sealed { .. })));
}

#[tokio::test]
async fn sealed_lookups_are_stable_under_load() {
    let dispatcher = Arc::new(bank(InstrumentMode::Dev));
    let expected = dispatcher.registry("x").unwrap().lookup("ping").unwrap().owner;

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let owner = dispatcher.registry("x").unwrap().lookup("ping").unwrap().owner;
                    assert_eq!(owner, expected);
                    assert!(call(&dispatcher, "ping", "{}").await.is_ok());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
}
