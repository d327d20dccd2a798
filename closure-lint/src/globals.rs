//! Names that are always resolvable inside an isolated unit.

/// Reserved and contextual keywords. Never reported as free identifiers.
pub const KEYWORDS: &[&str] = &[
    "async", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for",
    "function", "get", "if", "implements", "import", "in", "instanceof", "interface", "let",
    "new", "null", "of", "package", "private", "protected", "public", "return", "set", "static",
    "super", "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with",
    "yield",
];

/// Built-ins every unit runtime provides.
pub const SAFE_GLOBALS: &[&str] = &[
    // Value properties
    "undefined", "NaN", "Infinity", "globalThis", "arguments",
    // Fundamental objects
    "Object", "Function", "Boolean", "Symbol", "Number", "BigInt", "Math", "Date", "String",
    "RegExp", "JSON", "Reflect", "Proxy", "Intl", "Atomics", "WebAssembly",
    // Errors
    "Error", "AggregateError", "EvalError", "RangeError", "ReferenceError", "SyntaxError",
    "TypeError", "URIError",
    // Collections and buffers
    "Array", "Map", "Set", "WeakMap", "WeakSet", "WeakRef", "FinalizationRegistry",
    "ArrayBuffer", "SharedArrayBuffer", "DataView", "Int8Array", "Uint8Array",
    "Uint8ClampedArray", "Int16Array", "Uint16Array", "Int32Array", "Uint32Array",
    "Float32Array", "Float64Array", "BigInt64Array", "BigUint64Array",
    // Control abstraction
    "Promise",
    // Functions
    "parseInt", "parseFloat", "isNaN", "isFinite", "encodeURI", "encodeURIComponent",
    "decodeURI", "decodeURIComponent", "structuredClone", "queueMicrotask", "setTimeout",
    "clearTimeout", "setInterval", "clearInterval", "atob", "btoa",
    // Host objects present in every unit
    "console", "TextEncoder", "TextDecoder", "URL", "URLSearchParams", "crypto", "performance",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

pub fn is_safe_global(name: &str) -> bool {
    SAFE_GLOBALS.contains(&name)
}
