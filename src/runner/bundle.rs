//! Turns a multi-file project into one self-contained program.
//!
//! JavaScript projects are bundled into a CommonJS loader: every `.js`/`.json`
//! file is embedded as a string and compiled on first `require` with
//! `vm.compileFunction`, so stack traces keep the original file names and line
//! numbers. Bare specifiers fall through to the host `require`. Other languages
//! run the entry file directly with the remaining files placed beside it.

use std::collections::BTreeMap;

use super::types::LaunchRequest;
use crate::errors::RunnerError;
use crate::workspace::{language_for_path, normalize_path};

const JS_MODULE_EXTENSIONS: &[&str] = &["js", "cjs", "mjs", "json"];

const LOADER: &str = r#"
const __vm = require('vm');
const __cache = Object.create(null);
const __has = (p) => Object.prototype.hasOwnProperty.call(__files, p);

function __resolve(from, spec) {
  if (!(spec.startsWith('./') || spec.startsWith('../') || spec.startsWith('/'))) return null;
  const parts = spec.startsWith('/') ? [] : from.split('/').slice(0, -1);
  for (const seg of spec.split('/')) {
    if (seg === '' || seg === '.') continue;
    if (seg === '..') parts.pop(); else parts.push(seg);
  }
  const base = parts.join('/');
  const candidates = [base, base + '.js', base + '.cjs', base + '.mjs', base + '.json', base + '/index.js'];
  for (const candidate of candidates) {
    if (__has(candidate)) return candidate;
  }
  throw new Error("Cannot find module '" + spec + "' from '" + from + "'");
}

function __load(path) {
  if (__cache[path]) return __cache[path].exports;
  const module = { exports: {} };
  __cache[path] = module;
  if (path.endsWith('.json')) {
    module.exports = JSON.parse(__files[path]);
    return module.exports;
  }
  const dirname = path.split('/').slice(0, -1).join('/');
  const localRequire = (spec) => {
    const resolved = __resolve(path, spec);
    return resolved === null ? require(spec) : __load(resolved);
  };
  const fn = __vm.compileFunction(
    __files[path],
    ['exports', 'require', 'module', '__filename', '__dirname'],
    { filename: path }
  );
  fn.call(module.exports, module.exports, localRequire, module, path, dirname);
  return module.exports;
}
"#;

fn is_js_module(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| JS_MODULE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Bundle `files` for execution starting at `entry`.
pub fn prepare(
    run_id: &str,
    files: &BTreeMap<String, String>,
    entry: &str,
) -> Result<LaunchRequest, RunnerError> {
    let entry = normalize_path(entry)
        .filter(|p| files.contains_key(p))
        .ok_or_else(|| RunnerError::EntryNotFound {
            path: entry.to_string(),
        })?;
    let language = language_for_path(&entry).to_string();

    if language == "javascript" {
        let code = bundle_javascript(files, &entry).map_err(|e| RunnerError::Launch(std::io::Error::other(e)))?;
        return Ok(LaunchRequest {
            run_id: run_id.to_string(),
            language,
            code,
            support_files: BTreeMap::new(),
        });
    }

    let code = files.get(&entry).cloned().unwrap_or_default();
    let support_files = files
        .iter()
        .filter(|(path, _)| **path != entry)
        .map(|(path, content)| (path.clone(), content.clone()))
        .collect();
    Ok(LaunchRequest {
        run_id: run_id.to_string(),
        language,
        code,
        support_files,
    })
}

/// Build the CommonJS bundle for `entry`.
pub fn bundle_javascript(files: &BTreeMap<String, String>, entry: &str) -> serde_json::Result<String> {
    let modules: BTreeMap<&str, &str> = files
        .iter()
        .filter(|(path, _)| is_js_module(path))
        .map(|(path, content)| (path.as_str(), content.as_str()))
        .collect();

    let table = serde_json::to_string(&modules)?;
    let entry_literal = serde_json::to_string(entry)?;
    Ok(format!(
        "(function () {{\nconst __files = {};\n{}\n__load({});\n}})();\n",
        table, LOADER, entry_literal
    ))
}
