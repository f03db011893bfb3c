//! Script sources installed into every sandbox context.

use crate::adaptor::{Adaptor, SCRIPT_GLOBALS};
use crate::error::{EngineError, EngineResult};

/// Delete every global that is not in `SCRIPT_GLOBALS`.
pub(crate) fn scrub_globals() -> String {
    let allowed = serde_json::to_string(SCRIPT_GLOBALS).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"
(function (allowed) {{
    var keep = new Set(allowed);
    Object.getOwnPropertyNames(globalThis).forEach(function (key) {{
        if (keep.has(key)) return;
        try {{ delete globalThis[key]; }} catch (e) {{ globalThis[key] = undefined; }}
    }});
}})({allowed});
"#
    )
}

/// Bridge functions the host calls to inspect and invoke script values.
pub(crate) const RUNTIME: &str = r#"
var __refs = [];
function __retain(value) {
    __refs.push(value);
    return __refs.length - 1;
}
function __invoke(index, json) {
    return __refs[index](JSON.parse(json));
}
function __invokeOperation(index, json) {
    var next = __refs[index](JSON.parse(json));
    if (next !== null && typeof next === 'object' && typeof next.then === 'function') {
        throw new TypeError('operations must return the next state synchronously');
    }
    if (next === null || typeof next !== 'object' || Array.isArray(next)) {
        throw new TypeError('operation did not return a state object');
    }
    if (typeof next.__operation === 'string' || Array.isArray(next.__plan) || next.__each === true) {
        throw new TypeError(
            'operation returned an unapplied operation; compose operations with execute(...) instead'
        );
    }
    return JSON.stringify(next);
}
function __kind(value) {
    if (typeof value === 'function') return 'function';
    if (Array.isArray(value)) return 'array';
    if (value !== null && typeof value === 'object') {
        var proto = Object.getPrototypeOf(value);
        if (proto === Object.prototype || proto === null) return 'object';
    }
    return 'literal';
}
function __entries(value) {
    return Object.keys(value).map(function (key) { return [key, value[key]]; });
}
function __toJson(value) {
    return value === undefined ? 'null' : JSON.stringify(value);
}
function __describe(op) {
    if (typeof op === 'function') {
        if (Array.isArray(op.__pipeline)) return { kind: 'pipeline', operations: op.__pipeline };
        return { kind: 'script', index: __retain(op) };
    }
    if (op !== null && typeof op === 'object' && op.__each === true) {
        return { kind: 'each', items: op.items, operations: [op.operation] };
    }
    if (op !== null && typeof op === 'object' && typeof op.__operation === 'string') {
        return { kind: 'builder', name: op.__operation, args: op.args };
    }
    return { kind: 'invalid', type: op === null ? 'null' : typeof op };
}
function __describeError(error) {
    var described = { message: String(error), detail: null };
    if (error !== null && typeof error === 'object') {
        if (typeof error.message === 'string') described.message = error.message;
        var detail = {};
        Object.keys(error).forEach(function (key) { detail[key] = error[key]; });
        described.detail = detail;
    }
    try {
        return JSON.stringify(described);
    } catch (e) {
        return JSON.stringify({ message: described.message, detail: null });
    }
}
function __operation(name, args) {
    return { __operation: name, args: args };
}
function __format(args) {
    return Array.prototype.map.call(args, function (arg) {
        return typeof arg === 'string' ? arg : JSON.stringify(arg);
    }).join(' ');
}
var console = {
    log: function () { __log('info', __format(arguments)); },
    info: function () { __log('info', __format(arguments)); },
    debug: function () { __log('debug', __format(arguments)); },
    warn: function () { __log('warn', __format(arguments)); },
    error: function () { __log('error', __format(arguments)); }
};
"#;

/// Helper builders available to every expression.
pub(crate) const COMMON: &str = r#"
function execute() {
    var operations = Array.prototype.slice.call(arguments);
    var pipeline = function (state) {
        return { __plan: operations, state: state };
    };
    pipeline.__pipeline = operations;
    return pipeline;
}
function combine() {
    return execute.apply(undefined, Array.prototype.slice.call(arguments));
}
function fn(func) {
    return func;
}
var alterState = fn;
function __lookup(root, path) {
    var segments = String(path)
        .replace(/^\$\.?/, '')
        .split(/\.|\[(\d+)\]/)
        .filter(function (s) { return s !== undefined && s !== ''; });
    return segments.reduce(function (current, key) {
        return current === undefined || current === null ? undefined : current[key];
    }, root);
}
function dataPath(path) {
    var match = String(path).match(/^\$\.(.+)/);
    return '$.data.' + (match ? match[1] : path);
}
function sourceValue(path) {
    return function (state) { return __lookup(state, path); };
}
function dataValue(path) {
    return sourceValue(dataPath(path));
}
function lastReferenceValue(path) {
    return function (state) {
        var references = state.references || [];
        return __lookup(references[0], path);
    };
}
function __items(source, state) {
    var value = source;
    if (typeof source === 'function') value = source(state);
    else if (typeof source === 'string') value = __lookup(state, source.replace(/\[\*\]$/, ''));
    if (Array.isArray(value)) return value;
    return value === undefined || value === null ? [] : [value];
}
function __expand(value, state) {
    if (typeof value === 'function') return __expand(value(state), state);
    if (Array.isArray(value)) return value.map(function (item) { return __expand(item, state); });
    if (value !== null && typeof value === 'object') {
        var expanded = {};
        Object.keys(value).forEach(function (key) { expanded[key] = __expand(value[key], state); });
        return expanded;
    }
    return value;
}
function each(dataSource, operation) {
    return {
        __each: true,
        items: function (state) { return __items(dataSource, state); },
        operation: operation
    };
}
function merge(dataSource, extra) {
    return function (state) {
        var additions = __expand(extra, state);
        return __items(dataSource, state).map(function (item) {
            return Object.assign({}, item, additions);
        });
    };
}
function field(key, value) {
    return [key, value];
}
function fields() {
    var result = {};
    Array.prototype.forEach.call(arguments, function (pair) { result[pair[0]] = pair[1]; });
    return result;
}
function __indexOf(collection, target) {
    for (var i = 0; i < collection.length; i++) {
        if (collection[i] === target) return i;
    }
    return -1;
}
function convertMultipleChoice(chosenAnswers, condition, conditionsDict, delimiter) {
    var chosen = String(chosenAnswers).split(delimiter === undefined ? ' ' : delimiter);
    var result = {};
    if (chosenAnswers === 's_none') {
        result.s_none = true;
        return result;
    }
    (conditionsDict[condition] || []).forEach(function (option) {
        result[option] = __indexOf(chosen, option) !== -1;
    });
    return result;
}
function checkAnswers(chosenAnswers, target, delimiter) {
    var chosen = String(chosenAnswers).split(delimiter === undefined ? ' ' : delimiter);
    return __indexOf(chosen, target) !== -1;
}
function convertToBoolean(x) {
    if (x === 1 || x === '1' || x === 'true' || x === true) return true;
    if (x === 0 || x === '0' || x === -1 || x === '-1' || x === '' || x === 'false' || x === false) {
        return false;
    }
    return true;
}
"#;

/// Builder stubs and helper functions exported by `adaptor`.
pub(crate) fn adaptor_bindings(adaptor: &dyn Adaptor) -> EngineResult<String> {
    let mut source = String::new();
    for name in adaptor.operations() {
        ensure_identifier(name)?;
        source.push_str(&format!(
            "function {name}() {{ return __operation('{name}', Array.prototype.slice.call(arguments)); }}\n"
        ));
    }
    for helper in adaptor.helpers() {
        ensure_identifier(helper.name)?;
        source.push_str(helper.source);
        source.push('\n');
    }
    Ok(source)
}

fn ensure_identifier(name: &str) -> EngineResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(())
    } else {
        Err(EngineError::Sandbox(format!(
            "`{name}` cannot be exposed to scripts"
        )))
    }
}
