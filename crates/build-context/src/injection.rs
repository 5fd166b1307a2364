//! Marker-guarded code injections over the resource's main file
//!
//! Each injection is "ensure marker X exists, else insert template Y at
//! anchor Z". Inserted blocks are fenced by their marker and [`END_MARKER`],
//! so a second pass over injected output finds every marker and changes
//! nothing.

use crate::templates::{
    js_string, not_found_html, paywall_html, render, root_html, root_json,
    BROWSER_PAYWALL_TEMPLATE, HEALTH_TEMPLATE, NOT_FOUND_TEMPLATE, ROOT_PAGE_TEMPLATE,
};
use paygate_common::ResourceConfig;
use regex::Regex;
use std::sync::LazyLock;

pub const MARKER_PREFIX: &str = "// paygate:";
pub const END_MARKER: &str = "// paygate:end";

static APP_CREATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:const|let|var)\s+(\w+)\s*(?::[^=]+)?=\s*new\s+Hono\b")
        .expect("app creation regex is valid")
});

static ROOT_ROUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\.(?:get|all)\(\s*['"`]/['"`]"#).expect("root route regex is valid")
});

/// Where an injected block goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Directly after the app construction statement, after any blocks
    /// already injected there
    AfterAppCreation,
    /// Before the export/serve statement, or at the end of the file
    BeforeServerStart,
}

/// Values available to templates
#[derive(Debug, Clone)]
pub struct InjectionContext<'a> {
    /// Variable holding the app instance
    pub app: String,
    pub config: &'a ResourceConfig,
}

pub struct Injection {
    pub name: &'static str,
    pub marker: &'static str,
    pub anchor: Anchor,
    /// Checked against the current source; false means the user code
    /// already covers what this injection would add
    pub applies: fn(&str) -> bool,
    pub template: fn(&InjectionContext<'_>) -> String,
}

impl Injection {
    fn is_present(&self, lines: &[String]) -> bool {
        lines.iter().any(|line| line.trim() == self.marker)
    }

    fn block(&self, ctx: &InjectionContext<'_>) -> Vec<String> {
        let mut block = vec![self.marker.to_string()];
        block.extend((self.template)(ctx).lines().map(str::to_string));
        block.push(END_MARKER.to_string());
        block
    }
}

/// The injections every resource gets, in application order
pub fn default_injections() -> Vec<Injection> {
    vec![
        Injection {
            name: "browser-paywall",
            marker: "// paygate:browser-paywall",
            anchor: Anchor::AfterAppCreation,
            applies: |_| true,
            template: |ctx| {
                render(
                    BROWSER_PAYWALL_TEMPLATE,
                    &[
                        ("APP", ctx.app.as_str()),
                        ("PAYWALL_HTML", js_string(&paywall_html(ctx.config)).as_str()),
                    ],
                )
            },
        },
        Injection {
            name: "health",
            marker: "// paygate:health",
            anchor: Anchor::AfterAppCreation,
            applies: |_| true,
            template: |ctx| {
                render(
                    HEALTH_TEMPLATE,
                    &[("APP", ctx.app.as_str()), ("RESOURCE_ID", js_string(&ctx.config.id).as_str())],
                )
            },
        },
        Injection {
            name: "root-page",
            marker: "// paygate:root-page",
            anchor: Anchor::AfterAppCreation,
            applies: |source| !ROOT_ROUTE_REGEX.is_match(source),
            template: |ctx| {
                render(
                    ROOT_PAGE_TEMPLATE,
                    &[
                        ("APP", ctx.app.as_str()),
                        ("ROOT_HTML", js_string(&root_html(ctx.config)).as_str()),
                        ("ROOT_JSON", root_json(ctx.config).as_str()),
                    ],
                )
            },
        },
        Injection {
            name: "not-found",
            marker: "// paygate:not-found",
            anchor: Anchor::BeforeServerStart,
            applies: |source| !source.contains(".notFound("),
            template: |ctx| {
                render(
                    NOT_FOUND_TEMPLATE,
                    &[
                        ("APP", ctx.app.as_str()),
                        ("NOT_FOUND_HTML", js_string(&not_found_html(ctx.config)).as_str()),
                        ("RESOURCE_ID", js_string(&ctx.config.id).as_str()),
                    ],
                )
            },
        },
    ]
}

/// Apply `injections` in order to `source`.
///
/// Returns the new source and the names of the injections that were
/// inserted. When nothing is inserted the source comes back byte-identical.
/// Sources without a recognizable app construction are left alone.
pub fn apply_injections(
    source: &str,
    config: &ResourceConfig,
    injections: &[Injection],
) -> (String, Vec<&'static str>) {
    let Some((app, app_end_line)) = locate_app(source) else {
        tracing::warn!(resource_id = %config.id, "No app construction found, skipping injections");
        return (source.to_string(), Vec::new());
    };

    let ctx = InjectionContext { app, config };
    let mut lines: Vec<String> = source.lines().map(str::to_string).collect();
    let mut applied = Vec::new();

    for injection in injections {
        if injection.is_present(&lines) {
            continue;
        }
        let current = lines.join("\n");
        if !(injection.applies)(&current) {
            tracing::debug!(injection = injection.name, "User code already covers injection");
            continue;
        }

        let at = match injection.anchor {
            Anchor::AfterAppCreation => skip_injected_blocks(&lines, app_end_line + 1),
            Anchor::BeforeServerStart => find_server_start(&lines, app_end_line + 1),
        };
        let block = injection.block(&ctx);
        lines.splice(at..at, block);
        applied.push(injection.name);
    }

    if applied.is_empty() {
        return (source.to_string(), applied);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    (out, applied)
}

/// Find the app variable and the line on which its construction statement
/// ends. Handles constructors whose argument list spans several lines and
/// method chains continued on following lines (`.basePath('/api')`).
fn locate_app(source: &str) -> Option<(String, usize)> {
    let caps = APP_CREATION_REGEX.captures(source)?;
    let whole = caps.get(0)?;
    let name = caps.get(1)?.as_str().to_string();

    let mut end = constructor_end(source, whole.end());
    while end < source.len() {
        let rest = &source[end + 1..];
        let continued = rest.trim_start();
        if !continued.starts_with('.') {
            break;
        }
        end = chain_link_end(source, end + 1 + (rest.len() - continued.len()));
    }

    let end_line = source[..end.min(source.len())].matches('\n').count();
    Some((name, end_line))
}

/// Position of the `)` closing the constructor call, or of the first `;` or
/// newline when there is no argument list
fn constructor_end(source: &str, from: usize) -> usize {
    let mut depth = 0usize;
    let mut seen_paren = false;
    for (offset, c) in source[from..].char_indices() {
        let pos = from + offset;
        match c {
            '(' => {
                depth += 1;
                seen_paren = true;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                if seen_paren && depth == 0 {
                    return pos;
                }
            }
            ';' | '\n' if !seen_paren => return pos,
            _ => {}
        }
    }
    source.len()
}

/// Position of the `;` or newline ending a `.method(...)` link, outside any
/// parentheses
fn chain_link_end(source: &str, from: usize) -> usize {
    let mut depth = 0usize;
    for (offset, c) in source[from..].char_indices() {
        let pos = from + offset;
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ';' | '\n' if depth == 0 => return pos,
            _ => {}
        }
    }
    source.len()
}

fn skip_injected_blocks(lines: &[String], mut idx: usize) -> usize {
    while idx < lines.len() {
        let trimmed = lines[idx].trim();
        if !trimmed.starts_with(MARKER_PREFIX) || trimmed == END_MARKER {
            break;
        }
        match lines[idx..].iter().position(|l| l.trim() == END_MARKER) {
            Some(offset) => idx += offset + 1,
            None => break,
        }
    }
    idx.min(lines.len())
}

fn find_server_start(lines: &[String], from: usize) -> usize {
    let mut inside_block = false;
    for (idx, line) in lines.iter().enumerate().skip(from) {
        let trimmed = line.trim();
        if trimmed.starts_with(MARKER_PREFIX) {
            inside_block = trimmed != END_MARKER;
            continue;
        }
        if inside_block {
            continue;
        }
        if trimmed.starts_with("export default")
            || trimmed.contains("serve(")
            || trimmed.contains(".listen(")
        {
            return idx;
        }
    }
    lines.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use paygate_common::{PricingModel, ResourceType};
    use std::collections::HashMap;

    fn config() -> ResourceConfig {
        ResourceConfig {
            id: "r1".to_string(),
            name: "Quotes".to_string(),
            description: "Random quotes".to_string(),
            creator_wallet: "0x1111111111111111111111111111111111111111".to_string(),
            resource_type: ResourceType::Api,
            base_price_usdc: 0.01,
            pricing_model: PricingModel::PerRequest,
            tags: vec![],
            env_vars: HashMap::new(),
            endpoints: vec![],
        }
    }

    const SOURCE: &str = "import { Hono } from 'hono'\n\
import { serve } from '@hono/node-server'\n\
\n\
const app = new Hono()\n\
\n\
app.get('/quote', (c) => c.json({ q: 'hi' }))\n\
\n\
serve({ fetch: app.fetch, port: 3000 })\n";

    #[test]
    fn test_locate_app_single_line() {
        let (name, line) = locate_app(SOURCE).unwrap();
        assert_eq!(name, "app");
        assert_eq!(line, 3);
    }

    #[test]
    fn test_locate_app_multiline_constructor() {
        let src = "const server: Hono<Env> = new Hono<Env>({\n  strict: false,\n})\napp.get('/x')\n";
        let (name, line) = locate_app(src).unwrap();
        assert_eq!(name, "server");
        assert_eq!(line, 2);
    }

    #[test]
    fn test_locate_app_follows_method_chain() {
        let src = "const app = new Hono()\n  .basePath('/api')\n  .use(cors({\n    origin: '*',\n  }))\n\napp.get('/x')\n";
        let (name, line) = locate_app(src).unwrap();
        assert_eq!(name, "app");
        assert_eq!(line, 4);

        let same_line = "const app = new Hono().basePath('/v1');\napp.get('/x')\n";
        assert_eq!(locate_app(same_line).unwrap().1, 0);
    }

    #[test]
    fn test_injection_keeps_method_chain_intact() {
        let src = "const app = new Hono()\n  .basePath('/api')\n\napp.get('/quote', (c) => c.json({}))\nexport default app\n";
        let (out, _) = apply_injections(src, &config(), &default_injections());
        assert!(out.contains("const app = new Hono()\n  .basePath('/api')\n"));
        assert!(out.find(".basePath('/api')").unwrap() < out.find("// paygate:browser-paywall").unwrap());
    }

    #[test]
    fn test_injections_land_in_order() {
        let (out, applied) = apply_injections(SOURCE, &config(), &default_injections());
        assert_eq!(applied, vec!["browser-paywall", "health", "root-page", "not-found"]);

        let paywall = out.find("// paygate:browser-paywall").unwrap();
        let health = out.find("// paygate:health").unwrap();
        let root = out.find("// paygate:root-page").unwrap();
        let user_route = out.find("app.get('/quote'").unwrap();
        let not_found = out.find("// paygate:not-found").unwrap();
        let serve = out.find("serve({ fetch").unwrap();

        assert!(out.find("const app = new Hono()").unwrap() < paywall);
        assert!(paywall < health && health < root && root < user_route);
        assert!(user_route < not_found && not_found < serve);
        assert!(out.contains(r#"resourceId: "r1""#));
    }

    #[test]
    fn test_second_pass_is_noop() {
        let (once, _) = apply_injections(SOURCE, &config(), &default_injections());
        let (twice, applied) = apply_injections(&once, &config(), &default_injections());
        assert!(applied.is_empty());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_user_root_and_not_found_are_respected() {
        let src = "const app = new Hono()\napp.get(\"/\", (c) => c.text('mine'))\napp.notFound((c) => c.text('nope', 404))\nexport default app\n";
        let (out, applied) = apply_injections(src, &config(), &default_injections());
        assert_eq!(applied, vec!["browser-paywall", "health"]);
        assert!(!out.contains("// paygate:root-page"));
        assert!(!out.contains("// paygate:not-found"));
    }

    #[test]
    fn test_not_found_appended_without_server_start() {
        let src = "const app = new Hono();\napp.get('/a', (c) => c.text('a'));\n";
        let (out, _) = apply_injections(src, &config(), &default_injections());
        assert!(out.trim_end().ends_with(END_MARKER));
        assert!(out.find("// paygate:not-found").unwrap() > out.find("app.get('/a'").unwrap());
    }

    #[test]
    fn test_source_without_app_is_untouched() {
        let src = "export const handler = () => 'hi'\n";
        let (out, applied) = apply_injections(src, &config(), &default_injections());
        assert!(applied.is_empty());
        assert_eq!(out, src);
    }
}
