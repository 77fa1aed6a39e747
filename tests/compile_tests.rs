//! Compilation paths: background worker, compile server, cancellation and
//! allocation failure

mod common;

use common::*;
use pretty_assertions::assert_eq;
use quicksilver_jit::{ExecutionMode, JitConfig, Value};
use std::io::Write;
use std::time::Duration;

fn pinned_cookie(mut config: JitConfig) -> JitConfig {
    config.security.cookie = Some(0x5eed);
    config
}

#[test]
fn test_remote_compile_matches_in_process() {
    let local_config = pinned_cookie(quick_config());
    let remote_config = JitConfig {
        out_of_process: true,
        ..local_config.clone()
    };
    let (mut local, f) = load(local_config, &program(vec![add_one()]));
    let (mut remote, g) = load(remote_config, &program(vec![add_one()]));

    for i in 0..32 {
        assert_eq!(local.call(f, &[Value::Int(i)]).unwrap(), remote.call(g, &[Value::Int(i)]).unwrap());
    }
    assert_eq!(remote.execution_mode(g), ExecutionMode::FullJit);
    assert_eq!(local.transitions_for(f), remote.transitions_for(g));

    let a = local.compiled_code(f).unwrap();
    let b = remote.compiled_code(g).unwrap();
    assert_eq!(a.handle().code(), b.handle().code());
    assert_eq!(a.record.bailouts, b.record.bailouts);
    assert_eq!(a.record.register_map, b.record.register_map);
}

#[test]
fn test_background_compiles_install_at_call_boundaries() {
    let mut config = quick_config();
    config.background = true;
    let (mut engine, f) = load(config, &program(vec![add_one()]));

    for i in 0..4 {
        engine.call(f, &[Value::Int(i)]).unwrap();
    }
    // Queued, not yet installed
    assert_eq!(engine.execution_mode(f), ExecutionMode::Interpreter);
    assert_eq!(engine.wait_for_background(Duration::from_secs(10)), 1);
    assert_eq!(engine.execution_mode(f), ExecutionMode::SimpleJit);
    assert_eq!(engine.call(f, &[Value::Int(1)]).unwrap(), Value::Int(2));
    assert!(engine.context().wait_for_idle(Duration::from_secs(5)));
}

#[test]
fn test_invalidation_discards_in_flight_work() {
    let mut config = quick_config();
    config.background = true;
    let (mut engine, f) = load(config, &program(vec![add_one()]));

    for i in 0..4 {
        engine.call(f, &[Value::Int(i)]).unwrap();
    }
    engine.invalidate_function(f).unwrap();
    engine.wait_for_background(Duration::from_secs(10));

    assert_eq!(engine.stats().jit.discarded, 1);
    assert_eq!(engine.execution_mode(f), ExecutionMode::Interpreter);
    assert!(engine.compiled_code(f).is_none());

    // The next call asks again and that compile sticks
    engine.call(f, &[Value::Int(0)]).unwrap();
    engine.wait_for_background(Duration::from_secs(10));
    assert_eq!(engine.execution_mode(f), ExecutionMode::SimpleJit);
}

#[test]
fn test_invalidated_code_is_reinstalled_at_same_tier() {
    let (mut engine, f) = load(quick_config(), &program(vec![add_one()]));
    for i in 0..32 {
        engine.call(f, &[Value::Int(i)]).unwrap();
    }
    engine.invalidate_function(f).unwrap();
    assert!(engine.compiled_code(f).is_none());
    assert_eq!(engine.call(f, &[Value::Int(7)]).unwrap(), Value::Int(8));
    assert!(engine.compiled_code(f).is_some());
    assert_eq!(engine.execution_mode(f), ExecutionMode::FullJit);
}

#[test]
fn test_out_of_code_memory_stays_interpreted() {
    let mut config = quick_config();
    config.codegen.max_code_bytes = 16;
    let (mut engine, f) = load(config, &program(vec![add_one()]));
    for i in 0..64 {
        assert_eq!(engine.call(f, &[Value::Int(i)]).unwrap(), Value::Int(i + 1));
    }
    let stats = engine.stats();
    assert!(stats.jit.failed >= 1);
    assert_eq!(stats.jit.compiled, 0);
    assert_eq!(stats.live_code_bytes, 0);
    assert_eq!(engine.execution_mode(f), ExecutionMode::Interpreter);
}

#[test]
fn test_try_function_stays_interpreted() {
    let mut asm = quicksilver_jit::bytecode::Assembler::new("guarded", 0);
    let handler = asm.new_label();
    asm.try_begin(handler, 0).load_int(1, 3).throw(1);
    asm.bind(handler);
    asm.ret(0);
    let body = asm.finish().unwrap();
    let (mut engine, f) = load(quick_config(), &program(vec![body]));
    for _ in 0..32 {
        assert_eq!(engine.call(f, &[]).unwrap(), Value::string("3"));
    }
    assert_eq!(engine.execution_mode(f), ExecutionMode::Interpreter);
    assert!(engine.stats().jit.failed >= 1);
}

#[test]
fn test_listing_shows_every_stage() {
    let (mut engine, f) = load(quick_config(), &program(vec![add_one()]));
    for i in 0..3 {
        engine.call(f, &[Value::Int(i)]).unwrap();
    }
    let (encoded, listing) = engine.compile_listing(f, ExecutionMode::FullJit).unwrap();
    assert!(!encoded.code.is_empty());
    assert!(!listing.ir.is_empty());
    assert!(!listing.lir.is_empty());
    assert!(!listing.passes.is_empty());
    // A listing never installs anything
    assert!(engine.compiled_code(f).is_none());
}

#[test]
fn test_config_file_drives_thresholds() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "background": false, "tiers": {{ "simple_jit_call_threshold": 2, "full_jit_call_threshold": 3 }} }}"#
    )
    .unwrap();
    let config = JitConfig::load(file.path()).unwrap();
    let (mut engine, f) = load(config, &program(vec![add_one()]));
    for i in 0..3 {
        engine.call(f, &[Value::Int(i)]).unwrap();
    }
    assert_eq!(engine.execution_mode(f), ExecutionMode::FullJit);
}
