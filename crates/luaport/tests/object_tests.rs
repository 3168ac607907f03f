//! Integration tests for `LuaObject` handles
//!
//! Covers:
//! - indexing, assignment and deletion
//! - attribute access and the local attribute store
//! - conversions and metafields
//! - calls with single and multiple results
//! - operators through Lua semantics, including metamethods and type errors
//! - handle identity and iteration over tables
//! - stack balance after failed operations and iteration

use luaport::{ArithOp, CompareOp, Error, LuaObject, LuaType, Runtime, UnaryOp, Value};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn bytes(text: &str) -> Value {
    Value::Bytes(text.as_bytes().to_vec())
}

fn lua(rt: &Runtime, expression: &str) -> LuaObject {
    match rt.eval(expression, &[]).unwrap() {
        Value::Lua(obj) => obj,
        other => rt.to_lua(&other).unwrap(),
    }
}

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().map(|&v| Value::Integer(v)).collect()
}

fn top(rt: &Runtime) -> i32 {
    rt.lock().top().unwrap()
}

// =============================================================================
// Indexing Tests
// =============================================================================

#[test]
fn test_get_and_set() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{}");
    table.set("name", "lua").unwrap();
    table.set(1, 100).unwrap();
    assert_eq!(table.get("name").unwrap(), bytes("lua"));
    assert_eq!(table.get(1).unwrap(), Value::Integer(100));
    assert_eq!(table.get("missing").unwrap(), Value::Nil);
    assert!(table.contains_key("name").unwrap());
    assert!(!table.contains_key("missing").unwrap());
}

#[test]
fn test_index_honors_metamethods() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "setmetatable({}, {__index = function(t, k) return k .. '!' end})");
    assert_eq!(table.get("hey").unwrap(), bytes("hey!"));
}

#[test]
fn test_index_non_indexable() {
    let rt = Runtime::new().unwrap();
    let number = rt.to_lua(&Value::Integer(3)).unwrap();
    assert!(matches!(number.get("x"), Err(Error::Type(_))));
    assert!(matches!(number.set("x", 1), Err(Error::Type(_))));
}

#[test]
fn test_delete_integer_key_shifts() {
    let rt = Runtime::new().unwrap();
    let table = rt.table(&ints(&[1, 2, 3]), &[]).unwrap();
    table.delete(1).unwrap();
    assert_eq!(table.len().unwrap(), 2);
    assert_eq!(table.get(1).unwrap(), Value::Integer(2));
    assert_eq!(table.get(2).unwrap(), Value::Integer(3));
}

#[test]
fn test_delete_string_key() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{a = 1, b = 2}");
    table.delete("a").unwrap();
    assert_eq!(table.get("a").unwrap(), Value::Nil);
    assert_eq!(table.get("b").unwrap(), Value::Integer(2));
}

// =============================================================================
// Attribute Tests
// =============================================================================

#[test]
fn test_attributes_read_the_table() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{x = 1}");
    assert_eq!(table.attr("x").unwrap(), Value::Integer(1));
    table.set_attr("y", 2).unwrap();
    assert_eq!(table.get("y").unwrap(), Value::Integer(2));
    table.del_attr("x").unwrap();
    assert_eq!(table.get("x").unwrap(), Value::Nil);
}

#[test]
fn test_edit_mode_uses_local_store() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{x = 1}");
    table.set_edit_mode(true);
    table.set_attr("x", 99).unwrap();
    assert_eq!(table.attr("x").unwrap(), Value::Integer(99));
    assert_eq!(table.get("x").unwrap(), Value::Integer(1));

    // local attributes shadow the table after edit mode ends
    table.set_edit_mode(false);
    assert_eq!(table.attr("x").unwrap(), Value::Integer(99));
    table.del_attr("x").unwrap();
    assert_eq!(table.attr("x").unwrap(), Value::Integer(1));
}

#[test]
fn test_dunder_attributes_stay_local() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{}");
    assert!(matches!(table.attr("__doc__"), Err(Error::Attribute(_))));
    table.set_attr("__doc__", "docs").unwrap();
    assert_eq!(table.attr("__doc__").unwrap(), Value::from("docs"));
    assert_eq!(table.get("__doc__").unwrap(), Value::Nil);
    assert!(matches!(table.del_attr("__missing__"), Err(Error::Attribute(_))));
}

// =============================================================================
// Conversion Tests
// =============================================================================

#[test]
fn test_kind_and_type_name() {
    let rt = Runtime::new().unwrap();
    assert_eq!(lua(&rt, "{}").kind().unwrap(), LuaType::Table);
    assert_eq!(lua(&rt, "print").kind().unwrap(), LuaType::Function);
    assert_eq!(lua(&rt, "coroutine.create(print)").type_name().unwrap(), "thread");
    assert_eq!(rt.to_lua(&Value::from("s")).unwrap().type_name().unwrap(), "string");
}

#[test]
fn test_numeric_conversions() {
    let rt = Runtime::new().unwrap();
    let float = rt.to_lua(&Value::Number(2.0)).unwrap();
    assert_eq!(float.to_integer().unwrap(), 2);
    let text = rt.to_lua(&Value::from("1.5")).unwrap();
    assert_eq!(text.to_number().unwrap(), 1.5);
    assert!(matches!(text.to_integer(), Err(Error::Type(_))));
    assert!(matches!(lua(&rt, "{}").to_number(), Err(Error::Type(_))));
}

#[test]
fn test_truthiness() {
    let rt = Runtime::new().unwrap();
    assert!(rt.to_lua(&Value::Integer(0)).unwrap().to_bool().unwrap());
    assert!(!rt.to_lua(&Value::Boolean(false)).unwrap().to_bool().unwrap());
    assert!(!rt.nil().to_bool().unwrap());
}

#[test]
fn test_tostring_uses_metamethod() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "setmetatable({}, {__tostring = function() return 'custom' end})");
    assert_eq!(table.to_str().unwrap(), "custom");
    assert_eq!(table.to_bytes().unwrap(), b"custom".to_vec());
}

#[test]
fn test_len_uses_metamethod() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "setmetatable({}, {__len = function() return 7 end})");
    assert_eq!(table.len().unwrap(), 7);
    assert!(matches!(lua(&rt, "print").len(), Err(Error::Type(_))));
}

#[test]
fn test_metafield() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "setmetatable({}, {__name = 'thing'})");
    assert_eq!(table.metafield("__name").unwrap(), bytes("thing"));
    assert_eq!(table.metafield("__index").unwrap(), Value::Nil);
    assert_eq!(lua(&rt, "{}").metafield("__name").unwrap(), Value::Nil);
}

// =============================================================================
// Call Tests
// =============================================================================

#[test]
fn test_call_collapses_results() {
    let rt = Runtime::new().unwrap();
    let none = lua(&rt, "function() end");
    let one = lua(&rt, "function(x) return x end");
    let many = lua(&rt, "function(...) return ... end");
    assert_eq!(none.call(&[]).unwrap(), Value::Nil);
    assert_eq!(one.call(&[Value::Integer(1)]).unwrap(), Value::Integer(1));
    assert_eq!(
        many.call(&ints(&[1, 2])).unwrap(),
        Value::Tuple(ints(&[1, 2]))
    );
    assert_eq!(many.call_multi(&[Value::Integer(1)]).unwrap(), ints(&[1]));
    assert!(many.call_multi(&[]).unwrap().is_empty());
}

#[test]
fn test_call_table_with_call_metamethod() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "setmetatable({}, {__call = function(self, x) return x * 2 end})");
    assert!(table.is_callable());
    assert_eq!(table.call(&[Value::Integer(21)]).unwrap(), Value::Integer(42));
}

#[test]
fn test_call_non_callable() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{}");
    assert!(!table.is_callable());
    match table.call(&[]) {
        Err(Error::Lua(err)) => {
            assert!(err.message.contains("attempt to call a table value"));
            assert!(err.traceback.is_none());
        }
        other => panic!("expected a Lua error, got {:?}", other),
    }
}

#[test]
fn test_traceback_only_for_callables() {
    let rt = Runtime::new().unwrap();
    let failing = lua(&rt, "function() error('boom') end");
    match failing.call(&[]) {
        Err(Error::Lua(err)) => {
            assert!(err.message.ends_with("boom"));
            assert!(err.traceback.is_some());
        }
        other => panic!("expected a Lua error, got {:?}", other),
    }
    let number = lua(&rt, "7");
    match number.call(&[]) {
        Err(Error::Lua(err)) => assert!(err.traceback.is_none()),
        other => panic!("expected a Lua error, got {:?}", other),
    }
}

// =============================================================================
// Operator Tests
// =============================================================================

#[test]
fn test_arithmetic_on_numbers() {
    let rt = Runtime::new().unwrap();
    let five = rt.to_lua(&Value::Integer(5)).unwrap();
    assert_eq!((&five + 3).unwrap(), Value::Integer(8));
    assert_eq!((&five - 7).unwrap(), Value::Integer(-2));
    assert_eq!((&five * 2.0).unwrap(), Value::Number(10.0));
    assert_eq!((&five / 2).unwrap(), Value::Number(2.5));
    assert_eq!((&five % 3).unwrap(), Value::Integer(2));
    assert_eq!(five.arith(ArithOp::Pow, &Value::Integer(2)).unwrap(), Value::Number(25.0));
    assert_eq!(five.arith(ArithOp::IDiv, &Value::Integer(2)).unwrap(), Value::Integer(2));
    assert_eq!(five.arith_reflected(ArithOp::Sub, &Value::Integer(1)).unwrap(), Value::Integer(-4));
}

#[test]
fn test_bitwise_on_numbers() {
    let rt = Runtime::new().unwrap();
    let six = rt.to_lua(&Value::Integer(6)).unwrap();
    assert_eq!((&six & 3).unwrap(), Value::Integer(2));
    assert_eq!((&six | 1).unwrap(), Value::Integer(7));
    assert_eq!((&six ^ 2).unwrap(), Value::Integer(4));
    assert_eq!((&six << 1).unwrap(), Value::Integer(12));
    assert_eq!((&six >> 1).unwrap(), Value::Integer(3));
    assert_eq!((!&six).unwrap(), Value::Integer(!6));
    assert_eq!((-&six).unwrap(), Value::Integer(-6));
}

#[test]
fn test_string_coercion_in_arithmetic() {
    let rt = Runtime::new().unwrap();
    let text = rt.to_lua(&Value::from("10")).unwrap();
    assert_eq!((&text + 1).unwrap(), Value::Integer(11));
}

#[test]
fn test_arithmetic_metamethod() {
    let rt = Runtime::new().unwrap();
    let table = lua(
        &rt,
        "setmetatable({v = 3}, {__add = function(a, b) return a.v + b end, __unm = function(a) return -a.v end})",
    );
    assert_eq!((&table + 4).unwrap(), Value::Integer(7));
    assert_eq!(table.unary(UnaryOp::Neg).unwrap(), Value::Integer(-3));
}

#[test]
fn test_arithmetic_type_error() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{}");
    match &table + 1 {
        Err(Error::Type(message)) => {
            assert_eq!(message, "unsupported operand type(s) for +: 'Lua table' and 'int'")
        }
        other => panic!("expected a type error, got {:?}", other),
    }
    assert!(matches!(-&table, Err(Error::Type(_))));
}

#[test]
fn test_metamethod_errors_pass_through() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "setmetatable({}, {__add = function() error('custom failure') end})");
    match &table + 1 {
        Err(Error::Lua(err)) => assert!(err.message.contains("custom failure")),
        other => panic!("expected the metamethod's error, got {:?}", other),
    }
}

#[test]
fn test_comparisons() {
    let rt = Runtime::new().unwrap();
    let five = rt.to_lua(&Value::Integer(5)).unwrap();
    assert!(five.lt(6).unwrap());
    assert!(five.le(5).unwrap());
    assert!(five.gt(4).unwrap());
    assert!(five.ge(5).unwrap());
    assert!(!five.gt(5).unwrap());
    assert!(five.equals(5.0).unwrap());
    assert!(five.compare(CompareOp::Eq, &Value::Integer(5)).unwrap());
}

#[test]
fn test_compare_strings_with_host_text() {
    let rt = Runtime::new().unwrap();
    let text = rt.to_lua(&Value::from("abc")).unwrap();
    assert!(text.equals("abc").unwrap());
    assert!(text.lt("abd").unwrap());
}

#[test]
fn test_ordering_type_error() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{}");
    assert!(matches!(table.lt(1), Err(Error::Type(_))));
    assert!(!table.equals(1).unwrap());
}

#[test]
fn test_eq_metamethod() {
    let rt = Runtime::new().unwrap();
    rt.execute("mt = {__eq = function() return true end}", &[]).unwrap();
    let a = lua(&rt, "setmetatable({}, mt)");
    let b = lua(&rt, "setmetatable({}, mt)");
    assert!(a.equals(Value::Lua(b.clone())).unwrap());
    // handle equality is raw identity
    assert_ne!(a, b);
}

// =============================================================================
// Identity Tests
// =============================================================================

#[test]
fn test_clone_refers_to_same_value() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{}");
    let copy = table.clone();
    assert_eq!(table, copy);
    copy.set("k", 1).unwrap();
    assert_eq!(table.get("k").unwrap(), Value::Integer(1));
}

#[test]
fn test_debug_output() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{}");
    let debug = format!("{:?}", table);
    assert!(debug.contains("LuaObject"));
    assert!(debug.contains("table"));
}

#[test]
fn test_nil_handle() {
    let rt = Runtime::new().unwrap();
    let nil = rt.nil();
    assert!(nil.is_nil());
    assert_eq!(nil.to_value().unwrap(), Value::Nil);
    assert_eq!(lua(&rt, "nil").kind().unwrap(), LuaType::Nil);
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_items_of_table() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{10, 20, x = 'y'}");
    let mut items = table.items().unwrap().collect::<luaport::Result<Vec<_>>>().unwrap();
    items.sort_by_key(|(k, _)| format!("{:?}", k));
    assert_eq!(
        items,
        vec![
            (bytes("x"), bytes("y")),
            (Value::Integer(1), Value::Integer(10)),
            (Value::Integer(2), Value::Integer(20)),
        ]
    );
}

#[test]
fn test_sequence_keys_come_first() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{10, 20, 30, a = 1, b = 2}");
    let keys = table.keys().unwrap().collect::<luaport::Result<Vec<_>>>().unwrap();
    assert_eq!(keys.len(), 5);
    assert_eq!(keys[..3], ints(&[1, 2, 3])[..]);
    let mut named = keys[3..].to_vec();
    named.sort_by_key(|k| format!("{:?}", k));
    assert_eq!(named, vec![bytes("a"), bytes("b")]);
}

#[test]
fn test_values_follow_pairs_metamethod() {
    let rt = Runtime::new().unwrap();
    let table = lua(
        &rt,
        "setmetatable({}, {__pairs = function(t) \
            local i = 0 \
            return function() i = i + 1 if i <= 3 then return i, i * i end end, t, nil \
         end})",
    );
    let values = table.values().unwrap().collect::<luaport::Result<Vec<_>>>().unwrap();
    assert_eq!(values, ints(&[1, 4, 9]));
}

#[test]
fn test_list_view() {
    let rt = Runtime::new().unwrap();
    let list = lua(&rt, "{'a', 'b', 'c'}").as_list().unwrap();
    assert_eq!(list.get(-1).unwrap(), bytes("c"));
    list.insert(1, "z").unwrap();
    assert_eq!(
        list.to_vec().unwrap(),
        vec![bytes("a"), bytes("z"), bytes("b"), bytes("c")]
    );
    assert!(matches!(list.get(10), Err(Error::Index(_))));
}

// =============================================================================
// Stack Balance Tests
// =============================================================================

#[test]
fn test_failed_indexing_keeps_stack_balanced() {
    let rt = Runtime::new().unwrap();
    let guarded = lua(
        &rt,
        "setmetatable({}, {
            __index = function() error('no read') end,
            __newindex = function() error('no write') end,
        })",
    );
    let number = lua(&rt, "42");
    let base = top(&rt);

    assert!(matches!(guarded.get("x"), Err(Error::Lua(_))));
    assert!(matches!(guarded.set("x", 1), Err(Error::Lua(_))));
    assert!(matches!(guarded.delete("x"), Err(Error::Lua(_))));
    assert!(number.get("x").is_err());
    assert!(number.set("x", 1).is_err());
    assert!(number.delete(1).is_err());
    assert_eq!(top(&rt), base);
}

#[test]
fn test_iteration_keeps_stack_balanced() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{10, 20, 30, a = 1, b = 2}");
    let base = top(&rt);

    assert_eq!(table.keys().unwrap().count(), 5);
    let mut partial = table.values().unwrap();
    assert!(partial.next().is_some());
    assert_eq!(top(&rt), base);
    drop(partial);
    let mut broken = lua(&rt, "1").items().unwrap();
    assert!(matches!(broken.next(), Some(Err(Error::Lua(_)))));
    assert!(broken.next().is_none());
    assert_eq!(top(&rt), base);
}

#[test]
fn test_operator_errors_keep_stack_balanced() {
    let rt = Runtime::new().unwrap();
    let table = lua(&rt, "{}");
    let base = top(&rt);

    assert!(matches!(table.arith(ArithOp::Add, &Value::Integer(1)), Err(Error::Type(_))));
    assert!(matches!(table.arith_reflected(ArithOp::Mul, &Value::Integer(2)), Err(Error::Type(_))));
    assert!(matches!(table.unary(UnaryOp::Neg), Err(Error::Type(_))));
    assert!(matches!(table.lt(1), Err(Error::Type(_))));
    assert!(matches!(table.ge(1), Err(Error::Type(_))));
    assert!(matches!(table.to_integer(), Err(Error::Type(_))));
    assert_eq!(top(&rt), base);
}
