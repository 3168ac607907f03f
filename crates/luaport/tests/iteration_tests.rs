//! Integration tests for iteration in both directions
//!
//! Covers:
//! - `pairs` over host lists, maps and item views from Lua
//! - resuming a host traversal after an arbitrary key
//! - host-side iterators over Lua tables, including concurrent cursors
//! - the sequence view of a Lua table

use luaport::{as_attrgetter, Error, HostList, HostMap, HostObject, LuaObject, Runtime, Value};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn bytes(text: &str) -> Value {
    Value::Bytes(text.as_bytes().to_vec())
}

fn table(rt: &Runtime, code: &str) -> LuaObject {
    match rt.eval(code, &[]).unwrap() {
        Value::Lua(obj) => obj,
        other => panic!("expected a Lua value, got {:?}", other),
    }
}

struct Opaque;

impl HostObject for Opaque {
    fn type_name(&self) -> &str {
        "opaque"
    }
}

fn sample_map() -> Value {
    Value::object(HostMap::new(vec![
        (Value::from("a"), Value::Integer(1)),
        (Value::from("b"), Value::Integer(2)),
    ]))
}

// =============================================================================
// Host Values From Lua Tests
// =============================================================================

#[test]
fn test_pairs_over_host_list() {
    let rt = Runtime::new().unwrap();
    rt.set_global("l", Value::object(HostList::new(vec![Value::from("x"), Value::from("y")])))
        .unwrap();
    let result = rt
        .execute(
            "local keys, values = {}, {}
             for k, v in pairs(l) do keys[#keys + 1] = k values[#values + 1] = v end
             return table.concat(keys, ','), table.concat(values, ',')",
            &[],
        )
        .unwrap();
    assert_eq!(result, Value::Tuple(vec![bytes("0,1"), bytes("x,y")]));
}

#[test]
fn test_pairs_over_host_map() {
    let rt = Runtime::new().unwrap();
    rt.set_global("m", sample_map()).unwrap();
    let result = rt
        .execute(
            "local out = {}
             for k, v in pairs(m) do out[#out + 1] = k .. '=' .. v end
             return table.concat(out, ' ')",
            &[],
        )
        .unwrap();
    assert_eq!(result, bytes("a=1 b=2"));
}

#[test]
fn test_pairs_over_items_view() {
    let rt = Runtime::new().unwrap();
    rt.set_global("m", as_attrgetter(sample_map())).unwrap();
    let result = rt
        .execute(
            "local total = 0
             for k, v in pairs(m:items()) do total = total + v end
             return total",
            &[],
        )
        .unwrap();
    assert_eq!(result, Value::Integer(3));
}

#[test]
fn test_pairs_over_empty_list() {
    let rt = Runtime::new().unwrap();
    rt.set_global("l", Value::object(HostList::new(vec![]))).unwrap();
    assert_eq!(
        rt.execute("local n = 0 for _ in pairs(l) do n = n + 1 end return n", &[]).unwrap(),
        Value::Integer(0)
    );
}

#[test]
fn test_pairs_step_resumes_after_key() {
    let rt = Runtime::new().unwrap();
    let list = HostList::new((0..5).map(|i| Value::Integer(i * 10)).collect());
    rt.set_global("l", Value::object(list)).unwrap();
    let result = rt
        .execute(
            "local step, state = pairs(l)
             local k1 = step(state, nil)
             local k4, v4 = step(state, 3)
             local k2 = step(state, k1)
             return k1, k4, v4, k2",
            &[],
        )
        .unwrap();
    assert_eq!(
        result,
        Value::Tuple(vec![
            Value::Integer(0),
            Value::Integer(4),
            Value::Integer(40),
            Value::Integer(1),
        ])
    );
}

#[test]
fn test_pairs_step_unknown_key() {
    let rt = Runtime::new().unwrap();
    rt.set_global("l", Value::object(HostList::new(vec![Value::Integer(1)]))).unwrap();
    let result = rt.execute("local step, state = pairs(l) return step(state, 'nope')", &[]);
    assert!(matches!(result, Err(Error::Value(message)) if message == "invalid key to 'next'"));
}

#[test]
fn test_non_iterable_object() {
    let rt = Runtime::new().unwrap();
    rt.set_global("o", Value::object(Opaque)).unwrap();
    match rt.execute("for _ in pairs(o) do end", &[]) {
        Err(Error::Type(message)) => assert_eq!(message, "'opaque' object is not iterable"),
        other => panic!("expected a type error, got {:?}", other),
    }
}

// =============================================================================
// Lua Tables From the Host Tests
// =============================================================================

#[test]
fn test_keys_values_items() {
    let rt = Runtime::new().unwrap();
    let seq = table(&rt, "{'a', 'b', 'c'}");
    let keys: Vec<Value> = seq.keys().unwrap().collect::<luaport::Result<_>>().unwrap();
    assert_eq!(keys, vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    let values: Vec<Value> = seq.values().unwrap().collect::<luaport::Result<_>>().unwrap();
    assert_eq!(values, vec![bytes("a"), bytes("b"), bytes("c")]);
    let items: Vec<(Value, Value)> = seq.items().unwrap().collect::<luaport::Result<_>>().unwrap();
    assert_eq!(items[2], (Value::Integer(3), bytes("c")));
}

#[test]
fn test_iterators_are_independent() {
    let rt = Runtime::new().unwrap();
    let seq = table(&rt, "{10, 20, 30}");
    let mut first = seq.values().unwrap();
    let mut second = seq.values().unwrap();
    assert_eq!(first.next().unwrap().unwrap(), Value::Integer(10));
    assert_eq!(first.next().unwrap().unwrap(), Value::Integer(20));
    assert_eq!(second.next().unwrap().unwrap(), Value::Integer(10));
    assert_eq!(first.next().unwrap().unwrap(), Value::Integer(30));
    assert!(first.next().is_none());
    assert_eq!(second.next().unwrap().unwrap(), Value::Integer(20));
}

#[test]
fn test_nested_tables_stay_handles() {
    let rt = Runtime::new().unwrap();
    let nested = table(&rt, "{inner = {1, 2}}");
    let values: Vec<Value> = nested.values().unwrap().collect::<luaport::Result<_>>().unwrap();
    match &values[..] {
        [Value::Lua(inner)] => assert_eq!(inner.len().unwrap(), 2),
        other => panic!("expected one table handle, got {:?}", other),
    }
}

#[test]
fn test_iterator_error_ends_traversal() {
    let rt = Runtime::new().unwrap();
    let broken = table(&rt, "setmetatable({}, {__pairs = function() error('no pairs', 0) end})");
    let result = broken.keys();
    assert!(matches!(result, Err(Error::Lua(_))));
}

// =============================================================================
// List View Tests
// =============================================================================

#[test]
fn test_list_view_indexing() {
    let rt = Runtime::new().unwrap();
    let list = table(&rt, "{'a', 'b', 'c'}").as_list().unwrap();
    assert_eq!(list.len().unwrap(), 3);
    assert_eq!(list.get(0).unwrap(), bytes("a"));
    assert_eq!(list.get(-1).unwrap(), bytes("c"));
    assert!(matches!(list.get(3), Err(Error::Index(_))));
    assert!(matches!(list.get(-4), Err(Error::Index(_))));
}

#[test]
fn test_list_view_mutation() {
    let rt = Runtime::new().unwrap();
    let list = table(&rt, "{1, 2, 3}").as_list().unwrap();
    list.set(1, 20).unwrap();
    list.insert(0, 0).unwrap();
    list.push(4).unwrap();
    list.delete(-2).unwrap();
    assert_eq!(
        list.to_vec().unwrap(),
        vec![Value::Integer(0), Value::Integer(1), Value::Integer(20), Value::Integer(4)]
    );
    // the table sees the same elements
    assert_eq!(list.table().get(3).unwrap(), Value::Integer(20));
}

#[test]
fn test_list_view_insert_clamps() {
    let rt = Runtime::new().unwrap();
    let list = table(&rt, "{}").as_list().unwrap();
    assert!(list.is_empty().unwrap());
    list.insert(10, "end").unwrap();
    list.insert(-10, "start").unwrap();
    assert_eq!(list.to_vec().unwrap(), vec![bytes("start"), bytes("end")]);
}

#[test]
fn test_list_view_of_non_table() {
    let rt = Runtime::new().unwrap();
    let with_meta = table(&rt, "setmetatable({}, {})");
    assert!(with_meta.as_list().is_ok());
    let function = table(&rt, "print");
    assert!(matches!(function.as_list(), Err(Error::Type(_))));
}
