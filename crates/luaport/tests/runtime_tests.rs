//! Integration tests for the runtime surface
//!
//! Covers:
//! - compiling and running chunks, with and without arguments
//! - result collapsing for zero, one and several results
//! - syntax and runtime failures mapped to `LuaError`
//! - globals and table construction
//! - loading chunks from files
//! - closing a runtime and the garbage collector controls

use std::io::Write;

use luaport::{Encoding, Error, GcOp, HostList, HostMap, LuaErrorKind, Runtime, Value};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn bytes(text: &str) -> Value {
    Value::Bytes(text.as_bytes().to_vec())
}

fn lua_error(result: luaport::Result<Value>) -> luaport::LuaError {
    match result {
        Err(Error::Lua(err)) => err,
        other => panic!("expected a Lua error, got {:?}", other),
    }
}

// =============================================================================
// Execution Tests
// =============================================================================

#[test]
fn test_execute_single_result() {
    let rt = Runtime::new().unwrap();
    assert_eq!(rt.execute("return 1 + 1", &[]).unwrap(), Value::Integer(2));
}

#[test]
fn test_execute_no_result_is_nil() {
    let rt = Runtime::new().unwrap();
    assert_eq!(rt.execute("local x = 1", &[]).unwrap(), Value::Nil);
}

#[test]
fn test_execute_multiple_results_collapse_to_tuple() {
    let rt = Runtime::new().unwrap();
    let result = rt.execute("return 1, 2.5, 'x'", &[]).unwrap();
    assert_eq!(
        result,
        Value::Tuple(vec![Value::Integer(1), Value::Number(2.5), bytes("x")])
    );
}

#[test]
fn test_execute_with_arguments() {
    let rt = Runtime::new().unwrap();
    let result = rt
        .execute("local a, b = ... return a * b", &[Value::Integer(6), Value::Integer(7)])
        .unwrap();
    assert_eq!(result, Value::Integer(42));
}

#[test]
fn test_eval_expression_list() {
    let rt = Runtime::new().unwrap();
    assert_eq!(rt.eval("2 ^ 10", &[]).unwrap(), Value::Number(1024.0));
    assert_eq!(
        rt.eval("1, nil, true", &[]).unwrap(),
        Value::Tuple(vec![Value::Integer(1), Value::Nil, Value::Boolean(true)])
    );
}

#[test]
fn test_eval_byte_source() {
    let rt = Runtime::new().unwrap();
    assert_eq!(rt.eval(b"10 // 3", &[]).unwrap(), Value::Integer(3));
}

#[test]
fn test_compiled_function_is_reusable() {
    let rt = Runtime::new().unwrap();
    let square = rt.compile("local n = ... return n * n", "=square").unwrap();
    assert!(square.is_callable());
    for n in 1..=5 {
        assert_eq!(square.call(&[Value::Integer(n)]).unwrap(), Value::Integer(n * n));
    }
}

#[test]
fn test_source_encoding_latin1() {
    let rt = Runtime::builder()
        .encoding(Some(Encoding::Latin1))
        .source_encoding(Encoding::Latin1)
        .build()
        .unwrap();
    assert_eq!(rt.eval("#'é'", &[]).unwrap(), Value::Integer(1));
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_syntax_error_position() {
    let rt = Runtime::new().unwrap();
    let err = match rt.compile("x = = 1", "=chunk") {
        Err(Error::Lua(err)) => err,
        other => panic!("expected a syntax error, got {:?}", other),
    };
    assert_eq!(err.kind, LuaErrorKind::SyntaxFault);
    assert_eq!(err.chunk.as_deref(), Some("chunk"));
    assert_eq!(err.line, Some(1));
    assert!(err.traceback.is_none());
}

#[test]
fn test_syntax_error_on_later_line() {
    let rt = Runtime::new().unwrap();
    let err = match rt.compile("local a = 1\nlocal b = 2\nreturn a +", "=lines") {
        Err(Error::Lua(err)) => err,
        other => panic!("expected a syntax error, got {:?}", other),
    };
    assert_eq!(err.line, Some(3));
}

#[test]
fn test_runtime_error_carries_traceback() {
    let rt = Runtime::new().unwrap();
    let err = lua_error(rt.execute("error('boom')", &[]));
    assert_eq!(err.kind, LuaErrorKind::RuntimeFault);
    assert!(err.message.ends_with("boom"), "message: {}", err.message);
    assert_eq!(err.line, Some(1));
    let traceback = err.traceback.expect("traceback");
    assert!(traceback.starts_with("stack traceback:"));
}

#[test]
fn test_runtime_error_with_table_value() {
    let rt = Runtime::new().unwrap();
    let err = lua_error(rt.execute("error({})", &[]));
    assert_eq!(err.message, "(error object is a table value)");
}

#[test]
fn test_runtime_error_without_position() {
    let rt = Runtime::new().unwrap();
    let err = lua_error(rt.execute("error('plain', 0)", &[]));
    assert_eq!(err.message, "plain");
    assert_eq!(err.chunk, None);
}

#[test]
fn test_runtime_recovers_after_error() {
    let rt = Runtime::new().unwrap();
    assert!(rt.execute("error('first')", &[]).is_err());
    assert_eq!(rt.eval("40 + 2", &[]).unwrap(), Value::Integer(42));
}

// =============================================================================
// Globals and Table Tests
// =============================================================================

#[test]
fn test_globals_round_trip() {
    let rt = Runtime::new().unwrap();
    rt.set_global("answer", 42).unwrap();
    assert_eq!(rt.eval("answer", &[]).unwrap(), Value::Integer(42));
    assert_eq!(rt.get_global("answer").unwrap(), Value::Integer(42));
    assert_eq!(rt.get_global("missing").unwrap(), Value::Nil);
}

#[test]
fn test_globals_table_handle() {
    let rt = Runtime::new().unwrap();
    rt.execute("greeting = 'hi'", &[]).unwrap();
    let globals = rt.globals().unwrap();
    assert_eq!(globals.get("greeting").unwrap(), bytes("hi"));
    assert!(globals.contains_key("print").unwrap());
}

#[test]
fn test_table_positional_and_named() {
    let rt = Runtime::new().unwrap();
    let table = rt
        .table(
            &[Value::Integer(10), Value::Integer(20)],
            &[(Value::from("name"), Value::from("lua"))],
        )
        .unwrap();
    assert_eq!(table.len().unwrap(), 2);
    assert_eq!(table.get(1).unwrap(), Value::Integer(10));
    assert_eq!(table.get("name").unwrap(), bytes("lua"));
}

#[test]
fn test_table_rejects_nil_key() {
    let rt = Runtime::new().unwrap();
    let result = rt.table(&[], &[(Value::Nil, Value::Integer(1))]);
    assert!(matches!(result, Err(Error::Value(_))));
}

#[test]
fn test_table_from_sources() {
    let rt = Runtime::new().unwrap();
    let list = Value::object(HostList::new(vec![Value::from("a"), Value::from("b")]));
    let map = Value::object(HostMap::new(vec![(Value::from("k"), Value::Integer(1))]));
    let table = rt.table_from(&[list, map]).unwrap();
    assert_eq!(table.get(1).unwrap(), bytes("a"));
    assert_eq!(table.get(2).unwrap(), bytes("b"));
    assert_eq!(table.get("k").unwrap(), Value::Integer(1));
}

#[test]
fn test_table_from_later_keys_win() {
    let rt = Runtime::new().unwrap();
    let first = Value::object(HostMap::new(vec![(Value::from("k"), Value::Integer(1))]));
    let second = Value::object(HostMap::new(vec![(Value::from("k"), Value::Integer(2))]));
    let table = rt.table_from(&[first, second]).unwrap();
    assert_eq!(table.get("k").unwrap(), Value::Integer(2));
}

// =============================================================================
// File Loading Tests
// =============================================================================

#[test]
fn test_compile_path() {
    let rt = Runtime::new().unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "local n = ...").unwrap();
    writeln!(file, "return n + 1").unwrap();
    file.flush().unwrap();

    let function = rt.compile_path(file.path()).unwrap();
    assert_eq!(function.call(&[Value::Integer(41)]).unwrap(), Value::Integer(42));
}

#[test]
fn test_compile_path_missing_file() {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let err = match rt.compile_path(dir.path().join("missing.lua")) {
        Err(Error::Lua(err)) => err,
        other => panic!("expected a file error, got {:?}", other),
    };
    assert_eq!(err.kind, LuaErrorKind::FileFault);
}

#[test]
fn test_compile_path_syntax_error() {
    let rt = Runtime::new().unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "return +").unwrap();
    file.flush().unwrap();

    let err = match rt.compile_path(file.path()) {
        Err(Error::Lua(err)) => err,
        other => panic!("expected a syntax error, got {:?}", other),
    };
    assert_eq!(err.kind, LuaErrorKind::SyntaxFault);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_close_runtime() {
    let rt = Runtime::new().unwrap();
    let function = rt.compile("return 1", "=f").unwrap();
    assert!(!rt.is_closed());

    rt.close();
    assert!(rt.is_closed());
    assert!(matches!(rt.eval("1", &[]), Err(Error::Closed)));
    assert!(matches!(function.call(&[]), Err(Error::Closed)));
    assert!(matches!(rt.globals(), Err(Error::Closed)));

    // closing twice is harmless
    rt.close();
}

#[test]
fn test_close_releases_host_values() {
    let rt = Runtime::new().unwrap();
    rt.set_global("list", Value::object(HostList::new(vec![]))).unwrap();
    assert!(rt.live_handles() > 0);
    rt.close();
    assert_eq!(rt.live_handles(), 0);
}

#[test]
fn test_runtime_identity() {
    let a = Runtime::new().unwrap();
    let b = Runtime::new().unwrap();
    assert_ne!(a.id(), b.id());
    assert!(a.ptr_eq(&a.clone()));
    assert!(!a.ptr_eq(&b));
    assert!(a.version() >= 504);
}

#[test]
fn test_gc_controls() {
    let rt = Runtime::new().unwrap();
    rt.execute("garbage = {} for i = 1, 1000 do garbage[i] = {i} end garbage = nil", &[])
        .unwrap();
    assert!(rt.gc(GcOp::Count).unwrap() > 0);
    rt.gc(GcOp::Collect).unwrap();
    assert_eq!(rt.gc(GcOp::IsRunning).unwrap(), 1);
    rt.gc(GcOp::Stop).unwrap();
    assert_eq!(rt.gc(GcOp::IsRunning).unwrap(), 0);
    rt.gc(GcOp::Restart).unwrap();
    assert_eq!(rt.gc(GcOp::IsRunning).unwrap(), 1);
}
