//! Model lifecycle against the mock engine

mod common;

use cactus_bridge::{
    BridgeError, CompletionRequest, CompletionResult, CompletionStatus, HandleState, HandleTable,
    LifecycleError, MarshalError, Model, ResponseBuffer,
};
use common::*;
use pretty_assertions::assert_eq;
use rstest::rstest;

#[test]
fn test_create_yields_usable_handle() {
    let api = mock_engine();
    let before = live_models();

    let model = Model::create(&api, "model.bin", 2048).unwrap();
    assert_eq!(live_models(), before + 1);

    model.destroy();
    assert_eq!(live_models(), before);
}

#[test]
fn test_create_failure_is_defined() {
    let api = mock_engine();
    let err = Model::create(&api, "missing/model.bin", 2048).unwrap_err();

    assert!(matches!(
        err,
        BridgeError::EngineInit { ref model_path, context_size: 2048 }
            if model_path == "missing/model.bin"
    ));
}

#[rstest]
#[case("model\0.bin", 2048)]
#[case("model.bin", 0)]
fn test_create_rejects_bad_arguments(#[case] path: &str, #[case] context_size: usize) {
    let api = mock_engine();
    let before = live_models();

    let err = Model::create(&api, path, context_size).unwrap_err();
    assert!(err.is_acquisition_failure());
    assert!(matches!(err, BridgeError::Marshal(_)));
    assert_eq!(live_models(), before);
}

#[test]
fn test_run_with_buffer_only() {
    let api = mock_engine();
    let mut model = Model::create(&api, "model.bin", 2048).unwrap();
    let messages = user_messages("Hello");
    let (document, _) = expected_generation(&messages);

    let mut region = [0u8; 256];
    let mut buffer = ResponseBuffer::new(&mut region);
    let outcome = model
        .complete(&CompletionRequest::new(&messages), &mut buffer)
        .unwrap();

    assert_eq!(
        outcome.status,
        CompletionStatus::Complete {
            written: document.len()
        }
    );
    assert_eq!(outcome.text.as_deref(), Some(document.as_str()));
    assert_eq!(outcome.events.received, 0);

    let parsed = CompletionResult::parse(outcome.text.as_deref().unwrap()).unwrap();
    assert_eq!(parsed.response, "Echo: Hello");
}

#[test]
fn test_small_buffer_truncates() {
    let api = mock_engine();
    let mut model = Model::create(&api, "model.bin", 2048).unwrap();
    let messages = user_messages("Hi");
    let (document, _) = expected_generation(&messages);

    let mut region = [0xAAu8; 4];
    let mut buffer = ResponseBuffer::new(&mut region);
    let outcome = model
        .complete(&CompletionRequest::new(&messages), &mut buffer)
        .unwrap();

    assert!(outcome.status.is_truncated());
    assert_eq!(outcome.status.written(), Some(4));
    assert_eq!(outcome.status.code() as usize, document.len());
    assert_eq!(outcome.text.as_deref(), Some(&document[..4]));
    assert_eq!(&region[..], &document.as_bytes()[..4]);
}

#[test]
fn test_declared_size_larger_than_buffer_is_clamped() {
    let api = mock_engine();
    let mut model = Model::create(&api, "model.bin", 2048).unwrap();
    let messages = user_messages("clamp me please");

    let mut region = [0u8; 8];
    let mut buffer = ResponseBuffer::with_declared(&mut region, 1 << 20).unwrap();
    assert_eq!(buffer.capacity(), 8);

    let outcome = model
        .complete(&CompletionRequest::new(&messages), &mut buffer)
        .unwrap();
    assert_eq!(outcome.status.written(), Some(8));
}

#[test]
fn test_declared_size_is_respected_within_region() {
    let api = mock_engine();
    let mut model = Model::create(&api, "model.bin", 2048).unwrap();
    let messages = user_messages("Hi");

    let mut region = [0x55u8; 64];
    {
        let mut buffer = ResponseBuffer::with_declared(&mut region, 5).unwrap();
        let outcome = model
            .complete(&CompletionRequest::new(&messages), &mut buffer)
            .unwrap();
        assert_eq!(outcome.status.written(), Some(5));
    }
    // nothing past the declared capacity was touched
    assert!(region[5..].iter().all(|&b| b == 0x55));
}

#[test]
fn test_negative_declared_size_rejected() {
    let mut region = [0u8; 8];
    let err = ResponseBuffer::with_declared(&mut region, -1).unwrap_err();
    assert_eq!(
        err,
        MarshalError::OutOfRange {
            argument: "buffer_size",
            value: -1
        }
    );
}

#[test]
fn test_engine_failure_code_forwarded() {
    let api = mock_engine();
    let mut model = Model::create(&api, "model.bin", 2048).unwrap();
    let messages = user_messages("fail");

    let mut region = [0u8; 64];
    let mut buffer = ResponseBuffer::new(&mut region);
    let outcome = model
        .complete(&CompletionRequest::new(&messages), &mut buffer)
        .unwrap();

    assert_eq!(outcome.status, CompletionStatus::Failed { code: ENGINE_FAILURE });
    assert_eq!(outcome.status.code(), ENGINE_FAILURE);
    assert_eq!(outcome.text, None);
}

#[test]
fn test_options_and_tools_pass_through_verbatim() {
    let api = mock_engine();
    let mut model = Model::create(&api, "model.bin", 2048).unwrap();
    let messages = user_messages("Hi");
    let options = r#"{"temperature":0.1,"max_tokens":8}"#;
    let tools = r#"[{"name":"lookup"}]"#;

    let mut region = [0u8; 256];
    let mut buffer = ResponseBuffer::new(&mut region);
    let request = CompletionRequest::new(&messages)
        .with_options(options)
        .with_tools(tools);
    model.complete(&request, &mut buffer).unwrap();

    assert_eq!(last_options().as_deref(), Some(options));
    assert_eq!(last_tools().as_deref(), Some(tools));

    model
        .complete(&CompletionRequest::new(&messages), &mut buffer)
        .unwrap();
    assert_eq!(last_options(), None);
    assert_eq!(last_tools(), None);
}

#[test]
fn test_interior_nul_in_messages_rejected_before_engine() {
    let api = mock_engine();
    let mut model = Model::create(&api, "model.bin", 2048).unwrap();

    let mut region = [0u8; 64];
    let mut buffer = ResponseBuffer::new(&mut region);
    let err = model
        .complete(&CompletionRequest::new("[\0]"), &mut buffer)
        .unwrap_err();

    assert!(matches!(
        err,
        BridgeError::Marshal(MarshalError::InteriorNul {
            argument: "messages",
            position: 1
        })
    ));
}

#[test]
fn test_destroy_never_run_model() {
    let api = mock_engine();
    let calls = destroy_calls();

    let model = Model::create(&api, "model.bin", 512).unwrap();
    model.destroy();

    assert_eq!(destroy_calls(), calls + 1);
}

#[test]
fn test_drop_destroys_once() {
    let api = mock_engine();
    let calls = destroy_calls();

    {
        let _model = Model::create(&api, "model.bin", 512).unwrap();
    }

    assert_eq!(destroy_calls(), calls + 1);
}

#[test]
fn test_model_moves_between_threads() {
    let api = mock_engine();
    let live = live_models();
    let calls = destroy_calls();
    let mut model = Model::create(&api, "model.bin", 512).unwrap();

    let handle = std::thread::spawn(move || {
        let messages = user_messages("from another thread");
        let mut region = [0u8; 256];
        let mut buffer = ResponseBuffer::new(&mut region);
        let outcome = model
            .complete(&CompletionRequest::new(&messages), &mut buffer)
            .unwrap();
        outcome.status.is_success()
    });

    assert!(handle.join().unwrap());
    // the model was destroyed on the other thread
    assert_eq!(live_models(), live);
    assert_eq!(destroy_calls(), calls + 1);
}

#[test]
fn test_model_created_elsewhere_destroyed_here() {
    let api = mock_engine();
    let model = std::thread::spawn(move || Model::create(&api, "model.bin", 512).unwrap())
        .join()
        .unwrap();
    let live = live_models();
    let calls = destroy_calls();

    model.destroy();

    assert_eq!(live_models(), live);
    assert_eq!(destroy_calls(), calls);
}

// ============================================================================
// Handle table
// ============================================================================

fn table_with_model() -> (HandleTable, u64) {
    let table = HandleTable::new();
    let model = Model::create(&mock_engine(), "model.bin", 2048).unwrap();
    let id = table.insert(model);
    (table, id)
}

#[test]
fn test_table_ids_start_at_one() {
    let (table, id) = table_with_model();
    assert_eq!(id, 1);
    assert_eq!(table.insert(Model::create(&mock_engine(), "b.bin", 64).unwrap()), 2);
    assert_eq!(table.live(), 2);
}

#[test]
fn test_table_run_then_destroy() {
    let (table, id) = table_with_model();
    let messages = user_messages("Hi");

    let status = table
        .with_model(id, |model| {
            let mut region = [0u8; 256];
            let mut buffer = ResponseBuffer::new(&mut region);
            model
                .complete(&CompletionRequest::new(&messages), &mut buffer)
                .map(|outcome| outcome.status)
        })
        .unwrap()
        .unwrap();
    assert!(status.is_success());
    assert_eq!(table.state(id), Some(HandleState::Ready));

    let calls = destroy_calls();
    table.destroy(id).unwrap();
    assert_eq!(destroy_calls(), calls + 1);
    assert_eq!(table.state(id), Some(HandleState::Destroyed));
    assert_eq!(table.live(), 0);
}

#[test]
fn test_table_run_after_destroy() {
    let (table, id) = table_with_model();
    table.destroy(id).unwrap();

    assert_eq!(table.with_model(id, |_| ()), Err(LifecycleError::Destroyed(id)));
    assert_eq!(table.state(id), Some(HandleState::Destroyed));
}

#[test]
fn test_table_double_destroy() {
    let (table, id) = table_with_model();
    let calls = destroy_calls();

    table.destroy(id).unwrap();
    assert_eq!(table.destroy(id), Err(LifecycleError::Destroyed(id)));
    assert_eq!(destroy_calls(), calls + 1);
}

#[test]
fn test_table_unknown_id() {
    let (table, _) = table_with_model();
    assert_eq!(table.destroy(99), Err(LifecycleError::UnknownHandle(99)));
    assert_eq!(table.with_model(99, |_| ()), Err(LifecycleError::UnknownHandle(99)));
}

#[test]
fn test_table_busy_while_running() {
    let (table, id) = table_with_model();

    let nested = table
        .with_model(id, |_| {
            assert_eq!(table.state(id), Some(HandleState::Running));
            (table.with_model(id, |_| ()), table.destroy(id))
        })
        .unwrap();

    assert_eq!(nested, (Err(LifecycleError::Busy(id)), Err(LifecycleError::Busy(id))));
    assert_eq!(table.state(id), Some(HandleState::Ready));
    table.destroy(id).unwrap();
}

#[test]
fn test_table_model_returns_after_panic() {
    let (table, id) = table_with_model();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        table.with_model(id, |_| panic!("host code failed")).ok();
    }));

    assert!(result.is_err());
    assert_eq!(table.state(id), Some(HandleState::Ready));
    table.destroy(id).unwrap();
}
