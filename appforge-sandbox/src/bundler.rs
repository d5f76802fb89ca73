//! Bundles validated source files into a single deployable artifact.
//!
//! The bundler is deliberately small: local modules are inlined into one
//! entry (named exports share the entry scope, default exports go through
//! generated bindings), third-party imports resolve against a pre-approved
//! catalog, and a runtime shim supplies the sandbox's data-access and fetch
//! APIs in place of the primitives the generated code expects. No build is
//! ever attempted for source that carries a blocking security finding.

use crate::error::{Result, SandboxError};
use crate::transpile::transpile_file;
use crate::validator::{SecurityFinding, SecurityValidator};
use appforge_common::AppId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Modules resolvable at bundle time, with the pinned version the platform
/// ships. Anything else is rejected by the validator before we get here.
const APPROVED_BUNDLES: &[(&str, &str)] = &[
    ("react", "18.2.0"),
    ("react-dom", "18.2.0"),
    ("preact", "10.19.3"),
    ("d3", "7.8.5"),
    ("chart.js", "4.4.1"),
    ("lodash", "4.17.21"),
    ("date-fns", "3.3.1"),
    ("zod", "3.22.4"),
    ("uuid", "9.0.1"),
];

/// A third-party module the artifact depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub name: String,
    pub version: String,
    /// Import specifier as written in the source.
    pub specifier: String,
}

/// The validated, bundled, deployable output of one generation.
///
/// Immutable once produced; a new generation supersedes it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub app_id: AppId,
    pub entry_code: String,
    /// sha256 of `entry_code`, hex-encoded; used for cache busting.
    pub content_hash: String,
    pub size_bytes: usize,
    pub dependencies: Vec<ResolvedDependency>,
    /// Advisory findings only; blocking findings abort the bundle.
    pub findings: Vec<SecurityFinding>,
}

/// Field types the schema description can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    pub fields: Vec<FieldDescription>,
}

/// Schema description handed over by the generation pipeline; drives the
/// sample data seeded into the data-access shim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub entities: Vec<EntityDescription>,
}

struct ImportPatterns {
    import_from: Regex,
    bare_import: Regex,
    export_default: Regex,
    export_decl: Regex,
    export_list: Regex,
    require_call: Regex,
}

impl ImportPatterns {
    fn new() -> Self {
        Self {
            import_from: Regex::new(
                r#"^\s*import\s+([\w$]+(?:\s*,\s*\{[^}]*\})?|\{[^}]*\}|\*\s+as\s+[\w$]+)\s+from\s+["']([^"']+)["']\s*;?\s*$"#,
            )
            .expect("static regex"),
            bare_import: Regex::new(r#"^\s*import\s+["'][^"']+["']\s*;?\s*$"#)
                .expect("static regex"),
            export_default: Regex::new(r"^\s*export\s+default\s+(.*)$").expect("static regex"),
            export_decl: Regex::new(
                r"^(\s*)export\s+((?:const|let|var|function|class|async)\b.*)$",
            )
            .expect("static regex"),
            export_list: Regex::new(r"^\s*export\s*\{[^}]*\}\s*(?:from\s+[^;]+)?;?\s*$")
                .expect("static regex"),
            require_call: Regex::new(r#"require\s*\(\s*["']([^"']+)["']\s*\)"#)
                .expect("static regex"),
        }
    }
}

/// Turns generated source files into a deployable [`Artifact`].
pub struct CodeBundler {
    validator: SecurityValidator,
    catalog: HashMap<&'static str, &'static str>,
    patterns: ImportPatterns,
}

impl CodeBundler {
    pub fn new() -> Self {
        Self {
            validator: SecurityValidator::new(APPROVED_BUNDLES.iter().map(|(name, _)| *name)),
            catalog: APPROVED_BUNDLES.iter().copied().collect(),
            patterns: ImportPatterns::new(),
        }
    }

    /// Validate, transform, and assemble the submitted files.
    ///
    /// Any blocking finding aborts before the transform step; malformed
    /// source surfaces as [`SandboxError::Transpile`]. Both are
    /// non-retryable: the caller must regenerate the source.
    pub fn bundle(
        &self,
        app_id: &AppId,
        files: &HashMap<String, String>,
        schema: Option<&SchemaDescription>,
    ) -> Result<Artifact> {
        let mut paths: Vec<&String> = files.keys().collect();
        paths.sort();

        let script_paths: Vec<&String> = paths
            .iter()
            .copied()
            .filter(|p| is_script(p))
            .collect();

        let mut findings = Vec::new();
        for path in &script_paths {
            findings.extend(self.validator.validate(path, &files[*path]));
        }
        if findings.iter().any(|f| f.blocks()) {
            return Err(SandboxError::SecurityViolation(findings));
        }

        let entry_path = script_paths
            .iter()
            .find(|p| p.rsplit('/').next().is_some_and(is_entry_name))
            .copied()
            .ok_or_else(|| SandboxError::Transpile {
                file: "index.js".to_string(),
                message: "missing entry file: expected an index.(js|jsx|ts|tsx)".to_string(),
            })?;

        let mut dependencies: Vec<ResolvedDependency> = Vec::new();
        let mut modules = Vec::new();
        for path in &script_paths {
            let transpiled = transpile_file(path, &files[*path])?;
            let is_entry = *path == entry_path;
            let linked = self.link_module(path, &transpiled, is_entry, &mut dependencies)?;
            if is_entry {
                modules.push((usize::MAX, linked));
            } else {
                modules.push((modules.len(), linked));
            }
        }
        // Entry last, local modules in sorted-path order before it.
        modules.sort_by_key(|(order, _)| *order);

        dependencies.sort_by(|a, b| a.name.cmp(&b.name));
        dependencies.dedup();

        let assets: Vec<(&String, &String)> = paths
            .iter()
            .copied()
            .filter(|p| !is_script(p))
            .map(|p| (p, &files[p]))
            .collect();

        let mut entry_code = render_shim(schema, &assets);
        for (_, module) in &modules {
            entry_code.push('\n');
            entry_code.push_str(module);
        }

        let mut hasher = Sha256::new();
        hasher.update(entry_code.as_bytes());
        let content_hash = hex::encode(hasher.finalize());

        Ok(Artifact {
            app_id: app_id.clone(),
            size_bytes: entry_code.len(),
            content_hash,
            entry_code,
            dependencies,
            findings,
        })
    }

    /// Rewrite one module's import/export surface for single-entry
    /// assembly.
    fn link_module(
        &self,
        path: &str,
        source: &str,
        is_entry: bool,
        dependencies: &mut Vec<ResolvedDependency>,
    ) -> Result<String> {
        let mut out = String::with_capacity(source.len());
        out.push_str(&format!("// --- {} ---\n", path));

        let source = coalesce_imports(source);
        for line in source.lines() {
            if self.patterns.bare_import.is_match(line) || self.patterns.export_list.is_match(line)
            {
                continue;
            }

            if let Some(captures) = self.patterns.import_from.captures(line) {
                let bindings = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                let specifier = captures.get(2).map(|m| m.as_str()).unwrap_or("");

                if specifier.starts_with("./") || specifier.starts_with("../") {
                    if let Some(binding) = default_binding(bindings) {
                        out.push_str(&format!(
                            "const {} = __appforge_default_{};\n",
                            binding,
                            module_stem(specifier)
                        ));
                    }
                    // Named relative imports resolve through the shared
                    // entry scope once the module is inlined.
                    continue;
                }

                let version = self.catalog.get(specifier).ok_or_else(|| {
                    // The validator rejects these earlier; reaching here
                    // means the two tables diverged.
                    SandboxError::Transpile {
                        file: path.to_string(),
                        message: format!("unresolvable import '{}'", specifier),
                    }
                })?;
                dependencies.push(ResolvedDependency {
                    name: specifier.to_string(),
                    version: (*version).to_string(),
                    specifier: specifier.to_string(),
                });
                out.push_str(&render_catalog_import(bindings, specifier));
                continue;
            }

            if let Some(captures) = self.patterns.export_default.captures(line) {
                let rest = captures.get(1).map(|m| m.as_str()).unwrap_or("");
                if is_entry {
                    out.push_str(line);
                } else {
                    out.push_str(&format!(
                        "const __appforge_default_{} = {}",
                        module_stem(path),
                        rest
                    ));
                }
                out.push('\n');
                continue;
            }

            if let Some(captures) = self.patterns.export_decl.captures(line) {
                out.push_str(captures.get(1).map(|m| m.as_str()).unwrap_or(""));
                out.push_str(captures.get(2).map(|m| m.as_str()).unwrap_or(""));
                out.push('\n');
                continue;
            }

            let rewritten = self
                .patterns
                .require_call
                .replace_all(line, |caps: &regex::Captures<'_>| {
                    let name = &caps[1];
                    if let Some(version) = self.catalog.get(name) {
                        dependencies.push(ResolvedDependency {
                            name: name.to_string(),
                            version: (*version).to_string(),
                            specifier: name.to_string(),
                        });
                        format!("__appforge_require(\"{}\")", name)
                    } else {
                        caps[0].to_string()
                    }
                });
            out.push_str(&rewritten);
            out.push('\n');
        }
        Ok(out)
    }
}

impl Default for CodeBundler {
    fn default() -> Self {
        Self::new()
    }
}

/// Join multi-line static imports into single lines so the rewriting
/// patterns above see whole statements.
fn coalesce_imports(source: &str) -> String {
    let mut out = Vec::new();
    let mut lines = source.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let open_import = (trimmed.starts_with("import ") || trimmed.starts_with("import{"))
            && !trimmed.contains('"')
            && !trimmed.contains('\'');
        if !open_import {
            out.push(line.to_string());
            continue;
        }
        let mut joined = line.trim_end().to_string();
        for next in lines.by_ref() {
            joined.push(' ');
            joined.push_str(next.trim());
            if next.contains('"') || next.contains('\'') {
                break;
            }
        }
        out.push(joined);
    }
    out.join("\n")
}

fn is_script(path: &str) -> bool {
    matches!(
        path.rsplit('.').next().unwrap_or(""),
        "js" | "jsx" | "ts" | "tsx" | "mjs"
    )
}

fn is_entry_name(name: &str) -> bool {
    matches!(name, "index.js" | "index.jsx" | "index.ts" | "index.tsx" | "index.mjs")
}

/// `./components/Button.jsx` → `components_Button`
fn module_stem(specifier: &str) -> String {
    let trimmed = specifier
        .trim_start_matches("./")
        .trim_start_matches("../");
    let without_ext = match trimmed.rsplit_once('.') {
        Some((stem, ext)) if matches!(ext, "js" | "jsx" | "ts" | "tsx" | "mjs") => stem,
        _ => trimmed,
    };
    without_ext
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// The default-import binding name, if the import clause has one.
fn default_binding(bindings: &str) -> Option<&str> {
    let first = bindings.split(',').next()?.trim();
    if first.starts_with('{') || first.starts_with('*') {
        None
    } else {
        Some(first)
    }
}

/// Render the `const` bindings replacing a catalog import clause. Mixed
/// default + named clauses become two statements.
fn render_catalog_import(bindings: &str, specifier: &str) -> String {
    let require = format!("__appforge_require(\"{}\")", specifier);
    let bindings = bindings.trim();
    if bindings.starts_with('{') {
        return format!("const {} = {};\n", bindings, require);
    }
    if let Some(rest) = bindings.strip_prefix('*') {
        let name = rest.trim().trim_start_matches("as").trim();
        return format!("const {} = {};\n", name, require);
    }
    match bindings.split_once(',') {
        Some((default, named)) => format!(
            "const {} = {};\nconst {} = {};\n",
            default.trim(),
            require,
            named.trim(),
            require
        ),
        None => format!("const {} = {};\n", bindings.trim(), require),
    }
}

/// The runtime prelude injected ahead of all application code.
fn render_shim(schema: Option<&SchemaDescription>, assets: &[(&String, &String)]) -> String {
    let seed = serde_json::to_string(&mock_dataset(schema)).expect("seed data serializes");
    let asset_map: HashMap<&str, &str> = assets
        .iter()
        .map(|(path, content)| (path.as_str(), content.as_str()))
        .collect();
    let assets_json = serde_json::to_string(&asset_map).expect("asset map serializes");

    format!(
        r#"// appforge runtime shim
const __appforge_bundles = globalThis.__appforge_bundles ?? Object.create(null);
function __appforge_require(name) {{
  const bundle = __appforge_bundles[name];
  if (bundle === undefined) throw new Error("bundle not loaded: " + name);
  return bundle;
}}
const __appforge_assets = {assets};
const __appforge_seed = {seed};
const appforge = {{
  data: (() => {{
    const store = new Map(Object.entries(__appforge_seed).map(([k, v]) => [k, [...v]]));
    const rows = (entity) => store.get(entity) ?? store.set(entity, []).get(entity);
    return {{
      list: (entity) => [...rows(entity)],
      get: (entity, id) => rows(entity).find((r) => r.id === id) ?? null,
      create: (entity, row) => {{ rows(entity).push(row); return row; }},
      update: (entity, id, patch) => {{
        const row = rows(entity).find((r) => r.id === id);
        if (row) Object.assign(row, patch);
        return row ?? null;
      }},
      remove: (entity, id) => {{
        const all = rows(entity);
        const at = all.findIndex((r) => r.id === id);
        return at >= 0 ? all.splice(at, 1)[0] : null;
      }},
    }};
  }})(),
  fetch: (...args) => {{
    if (typeof globalThis.__appforge_fetch !== "function") {{
      return Promise.reject(new Error("platform fetch unavailable"));
    }}
    return globalThis.__appforge_fetch(...args);
  }},
  asset: (path) => __appforge_assets[path] ?? null,
}};
const h = globalThis.__appforge_h ?? ((tag, props, ...children) => ({{ tag, props: props ?? {{}}, children }}));
"#,
        assets = assets_json,
        seed = seed,
    )
}

/// Deterministic sample rows derived from the schema description.
fn mock_dataset(schema: Option<&SchemaDescription>) -> HashMap<String, Vec<serde_json::Value>> {
    let mut dataset = HashMap::new();
    let Some(schema) = schema else {
        return dataset;
    };

    for entity in &schema.entities {
        let mut rows = Vec::new();
        for i in 0..3u64 {
            let mut row = serde_json::Map::new();
            row.insert(
                "id".to_string(),
                serde_json::Value::String(format!("{}-{}", entity.name, i + 1)),
            );
            for field in &entity.fields {
                let value = match field.kind {
                    FieldKind::Text => {
                        serde_json::Value::String(format!("{} sample {}", field.name, i + 1))
                    }
                    FieldKind::Number => serde_json::Value::from((i + 1) * 10),
                    FieldKind::Boolean => serde_json::Value::Bool(i % 2 == 0),
                    FieldKind::Timestamp => serde_json::Value::String(format!(
                        "2024-01-0{}T00:00:00Z",
                        i + 1
                    )),
                };
                row.insert(field.name.clone(), value);
            }
            rows.push(serde_json::Value::Object(row));
        }
        dataset.insert(entity.name.clone(), rows);
    }
    dataset
}
