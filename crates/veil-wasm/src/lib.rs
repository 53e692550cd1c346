//! WebAssembly bindings for the Veil filter engine
//!
//! Exposes a single process-wide engine to JavaScript: load it from a
//! snapshot, or compile list texts into a snapshot, then query requests,
//! responses and cosmetics against it.

use std::sync::RwLock;

use veil_engine::{
    get_etld1, is_third_party, url::extract_host, CosmeticMatch, CosmeticQuery, Engine, FilterIndex,
    MatchDecision, MatchResult, PublicSuffixes, Request, ResponseMatch,
};
use wasm_bindgen::prelude::*;

struct EngineState {
    engine: Engine,
    size: usize,
}

static ENGINE_STATE: RwLock<Option<EngineState>> = RwLock::new(None);

/// Per-list compile figures reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListStats {
    name: String,
    lines: usize,
    network: usize,
    cosmetic: usize,
    skipped: usize,
}

fn with_engine<T>(f: impl FnOnce(&Engine) -> T) -> Option<T> {
    let guard = ENGINE_STATE.read().ok()?;
    guard.as_ref().map(|state| f(&state.engine))
}

fn set(target: &js_sys::Object, key: &str, value: &JsValue) {
    let _ = js_sys::Reflect::set(target, &key.into(), value);
}

fn string_array<'a>(values: impl IntoIterator<Item = &'a String>) -> js_sys::Array {
    let array = js_sys::Array::new();
    for value in values {
        array.push(&JsValue::from_str(value));
    }
    array
}

fn strings_from(value: &JsValue) -> Vec<String> {
    if value.is_undefined() || value.is_null() {
        return Vec::new();
    }
    js_sys::Array::from(value)
        .iter()
        .filter_map(|entry| entry.as_string())
        .collect()
}

/// Load an engine snapshot, replacing any engine loaded earlier.
#[wasm_bindgen]
pub fn init(snapshot_data: &[u8]) -> Result<(), JsValue> {
    let engine = Engine::deserialize(snapshot_data)
        .map_err(|e| JsValue::from_str(&format!("Failed to load snapshot: {}", e)))?;

    let mut guard = ENGINE_STATE
        .write()
        .map_err(|_| JsValue::from_str("Engine state is poisoned"))?;
    if guard.is_some() {
        web_sys::console::info_1(&JsValue::from_str("veil: replacing loaded engine"));
    }
    *guard = Some(EngineState {
        engine,
        size: snapshot_data.len(),
    });
    Ok(())
}

/// Install Public Suffix List text (`public_suffix_list.dat` format) used
/// for party and `$domain` decisions.
#[wasm_bindgen]
pub fn init_psl(psl_data: &str) -> Result<(), JsValue> {
    let suffixes = PublicSuffixes::parse(psl_data).map_err(|e| JsValue::from_str(&e.to_string()))?;
    veil_engine::init_psl(suffixes);
    Ok(())
}

#[wasm_bindgen]
pub fn is_initialized() -> bool {
    with_engine(|_| ()).is_some()
}

#[wasm_bindgen]
pub fn get_snapshot_info() -> JsValue {
    let result = js_sys::Object::new();
    let guard = match ENGINE_STATE.read() {
        Ok(guard) => guard,
        Err(_) => {
            set(&result, "initialized", &JsValue::from(false));
            return result.into();
        }
    };

    match guard.as_ref() {
        Some(state) => {
            let stats = state.engine.stats();
            set(&result, "initialized", &JsValue::from(true));
            set(&result, "size", &JsValue::from(state.size as u32));
            set(&result, "network", &JsValue::from(stats.network as u32));
            set(&result, "cosmetic", &JsValue::from(stats.cosmetic as u32));
            set(&result, "digest", &JsValue::from_str(&format!("{:016x}", state.engine.digest())));

            let lists = js_sys::Array::new();
            for name in state.engine.list_names() {
                lists.push(&JsValue::from_str(name));
            }
            set(&result, "lists", &lists);
        }
        None => set(&result, "initialized", &JsValue::from(false)),
    }
    result.into()
}

fn compile_lists(lists: &[(String, String)]) -> (Engine, Vec<ListStats>) {
    let mut leaves = Vec::with_capacity(lists.len());
    let mut stats = Vec::with_capacity(lists.len());

    for (name, text) in lists {
        let (engine, errors) = Engine::compile_with_errors(name, text);
        let counts = engine.stats();
        stats.push(ListStats {
            name: name.clone(),
            lines: text.lines().count(),
            network: counts.network,
            cosmetic: counts.cosmetic,
            skipped: errors.len(),
        });
        leaves.push(engine);
    }

    (Engine::merge(&leaves), stats)
}

/// Compile list texts into a snapshot.
///
/// `list_texts` is an array whose entries are either plain strings, named
/// `list-<index>`, or `{ name, text }` objects. The result carries the
/// snapshot bytes and per-list statistics; it does not load the engine.
#[wasm_bindgen]
pub fn compile_filter_lists(list_texts: JsValue) -> Result<JsValue, JsValue> {
    let list_array = js_sys::Array::from(&list_texts);
    if list_array.length() == 0 {
        return Err(JsValue::from_str("No list texts provided"));
    }

    let mut lists = Vec::with_capacity(list_array.length() as usize);
    for (idx, entry) in list_array.iter().enumerate() {
        if let Some(text) = entry.as_string() {
            lists.push((format!("list-{}", idx), text));
            continue;
        }
        let name = js_sys::Reflect::get(&entry, &"name".into())
            .ok()
            .and_then(|value| value.as_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("list-{}", idx));
        let text = js_sys::Reflect::get(&entry, &"text".into())
            .ok()
            .and_then(|value| value.as_string())
            .ok_or_else(|| JsValue::from_str("List text must be a string"))?;
        lists.push((name, text));
    }

    let (engine, list_stats) = compile_lists(&lists);
    let snapshot = engine
        .serialize()
        .map_err(|e| JsValue::from_str(&format!("Failed to encode snapshot: {}", e)))?;

    let js_result = js_sys::Object::new();
    set(&js_result, "snapshot", &js_sys::Uint8Array::from(snapshot.as_slice()));

    let stats_array = js_sys::Array::new();
    for stat in &list_stats {
        let entry = js_sys::Object::new();
        set(&entry, "name", &JsValue::from_str(&stat.name));
        set(&entry, "lines", &JsValue::from(stat.lines as u32));
        set(&entry, "network", &JsValue::from(stat.network as u32));
        set(&entry, "cosmetic", &JsValue::from(stat.cosmetic as u32));
        set(&entry, "skipped", &JsValue::from(stat.skipped as u32));
        stats_array.push(&entry);
    }
    set(&js_result, "listStats", &stats_array);

    Ok(js_result.into())
}

fn decision_name(decision: MatchDecision) -> &'static str {
    match decision {
        MatchDecision::Allow => "allow",
        MatchDecision::Block => "block",
        MatchDecision::Redirect => "redirect",
    }
}

fn match_result_to_js(result: &MatchResult) -> JsValue {
    let js_result = js_sys::Object::new();
    set(&js_result, "decision", &JsValue::from_str(decision_name(result.decision)));
    if let Some(filter) = &result.filter {
        set(&js_result, "filter", &JsValue::from_str(filter));
    }
    if let Some(list) = &result.list {
        set(&js_result, "list", &JsValue::from_str(list));
    }
    if let Some(redirect) = &result.redirect {
        let redirect_obj = js_sys::Object::new();
        set(&redirect_obj, "resource", &JsValue::from_str(&redirect.resource));
        set(&redirect_obj, "path", &JsValue::from_str(&redirect.path));
        set(&redirect_obj, "dataUrl", &JsValue::from_str(&redirect.data_url));
        set(&js_result, "redirect", &redirect_obj);
    }
    js_result.into()
}

/// Match one request. Before `init` every request is allowed.
#[wasm_bindgen]
pub fn match_request(url: &str, request_type: &str, initiator: Option<String>) -> JsValue {
    let request = Request::new(url, initiator.as_deref(), request_type);
    let result = with_engine(|engine| engine.match_request(&request)).unwrap_or_default();
    match_result_to_js(&result)
}

#[wasm_bindgen]
pub fn should_block(url: &str, request_type: &str, initiator: Option<String>) -> bool {
    let request = Request::new(url, initiator.as_deref(), request_type);
    with_engine(|engine| engine.match_request(&request).decision != MatchDecision::Allow)
        .unwrap_or(false)
}

/// CSP directives and HTML filters for a document response.
#[wasm_bindgen]
pub fn match_response(url: &str, request_type: &str, initiator: Option<String>) -> JsValue {
    let request = Request::new(url, initiator.as_deref(), request_type);
    let result: ResponseMatch =
        with_engine(|engine| engine.match_response(&request)).unwrap_or_default();

    let js_result = js_sys::Object::new();
    set(&js_result, "csp", &string_array(&result.csp));
    set(&js_result, "html", &string_array(&result.html));
    js_result.into()
}

/// Cosmetic rules for a page.
///
/// With `bootstrap` set this is the navigation pass; otherwise `classes`,
/// `ids` and `hrefs` (string arrays) drive an incremental DOM pass.
#[wasm_bindgen]
pub fn match_cosmetics(
    url: &str,
    bootstrap: bool,
    classes: JsValue,
    ids: JsValue,
    hrefs: JsValue,
) -> JsValue {
    let query = if bootstrap {
        CosmeticQuery::bootstrap(url)
    } else {
        CosmeticQuery::dom(url, strings_from(&classes), strings_from(&ids), strings_from(&hrefs))
    };
    let result =
        with_engine(|engine| engine.match_cosmetics(&query)).unwrap_or_else(|| CosmeticMatch {
            enable_generic: true,
            ..Default::default()
        });

    let js_result = js_sys::Object::new();
    set(&js_result, "styles", &JsValue::from_str(&result.styles));
    set(&js_result, "enableGeneric", &JsValue::from(result.enable_generic));
    set(&js_result, "extended", &string_array(&result.extended));

    let scriptlets = js_sys::Array::new();
    for call in &result.scriptlets {
        let call_obj = js_sys::Object::new();
        set(&call_obj, "name", &JsValue::from_str(&call.name));
        set(&call_obj, "args", &string_array(&call.args));
        scriptlets.push(&call_obj);
    }
    set(&js_result, "scriptlets", &scriptlets);

    js_result.into()
}

#[wasm_bindgen]
pub fn get_etld1_js(host: &str) -> String {
    get_etld1(host)
}

#[wasm_bindgen]
pub fn is_same_site(host1: &str, host2: &str) -> bool {
    get_etld1(host1) == get_etld1(host2)
}

#[wasm_bindgen]
pub fn is_third_party_js(site_host: &str, req_host: &str) -> bool {
    is_third_party(site_host, req_host)
}

#[wasm_bindgen]
pub fn extract_host_js(url: &str) -> Option<String> {
    extract_host(url).map(|h| h.to_string())
}
