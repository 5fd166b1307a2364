//! Source templates for generated files and injected handlers
//!
//! Templates use `{{NAME}}` tokens. Values spliced into code are JSON
//! encoded, which makes them valid JavaScript literals.

use paygate_common::{PricingModel, ResourceConfig};

pub const BROWSER_PAYWALL_TEMPLATE: &str = r#"{{APP}}.use('*', async (c, next) => {
  await next();
  const accept = c.req.header('accept') || '';
  if (c.res.status === 402 && accept.includes('text/html')) {
    const terms = c.res.headers.get('payment-required');
    const page = c.html({{PAYWALL_HTML}}, 402);
    if (terms) page.headers.set('payment-required', terms);
    c.res = page;
  }
});"#;

pub const HEALTH_TEMPLATE: &str = r#"{{APP}}.get('/health', (c) =>
  c.json({ status: 'ok', resourceId: {{RESOURCE_ID}}, timestamp: new Date().toISOString() })
);"#;

pub const ROOT_PAGE_TEMPLATE: &str = r#"{{APP}}.get('/', (c) => {
  if ((c.req.header('accept') || '').includes('text/html')) {
    return c.html({{ROOT_HTML}});
  }
  return c.json({{ROOT_JSON}});
});"#;

pub const NOT_FOUND_TEMPLATE: &str = r#"{{APP}}.notFound((c) => {
  if ((c.req.header('accept') || '').includes('text/html')) {
    return c.html({{NOT_FOUND_HTML}}, 404);
  }
  return c.json({ error: 'Not Found', path: c.req.path, resourceId: {{RESOURCE_ID}} }, 404);
});"#;

/// Replace `{{KEY}}` tokens
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{{}}}}}", key), value)
    })
}

/// JSON-encode a string so it can be spliced into JavaScript
pub fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{}</title>\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<style>body{{font-family:system-ui,sans-serif;max-width:40rem;margin:3rem auto;padding:0 1rem;color:#222}}\
code{{background:#f3f3f3;padding:.1rem .3rem;border-radius:3px}}li{{margin:.3rem 0}}</style>\
</head><body>{}</body></html>",
        html_escape(title),
        body
    )
}

fn price_unit(model: PricingModel) -> &'static str {
    match model {
        PricingModel::PerRequest => "per request",
        PricingModel::PerToken => "per token",
        PricingModel::PerMinute => "per minute",
        PricingModel::Flat => "flat fee",
    }
}

/// Page shown to browsers hitting a pay-walled endpoint
pub fn paywall_html(config: &ResourceConfig) -> String {
    page(
        &format!("{} - payment required", config.name),
        &format!(
            "<h1>Payment required</h1><p><strong>{}</strong> is a paid API. \
Requests must carry a payment made with an HTTP payment-protocol client; \
a browser cannot pay for it directly.</p><p>Base price: {} USDC {}.</p>",
            html_escape(&config.name),
            config.base_price_usdc,
            price_unit(config.pricing_model)
        ),
    )
}

/// Informational page served at `/`
pub fn root_html(config: &ResourceConfig) -> String {
    let endpoints: String = config
        .endpoints
        .iter()
        .map(|e| {
            let price = e.price_usdc.unwrap_or(config.base_price_usdc);
            format!(
                "<li><code>{} {}</code> {} ({} USDC {})</li>",
                html_escape(&e.method.to_uppercase()),
                html_escape(&e.path),
                html_escape(&e.description),
                price,
                price_unit(config.pricing_model)
            )
        })
        .collect();

    page(
        &config.name,
        &format!(
            "<h1>{}</h1><p>{}</p><h2>Endpoints</h2><ul>{}</ul>",
            html_escape(&config.name),
            html_escape(&config.description),
            endpoints
        ),
    )
}

/// Machine-readable description served at `/` to non-browser clients
pub fn root_json(config: &ResourceConfig) -> String {
    let endpoints: Vec<serde_json::Value> = config
        .endpoints
        .iter()
        .map(|e| {
            serde_json::json!({
                "method": e.method.to_uppercase(),
                "path": e.path,
                "description": e.description,
                "priceUsdc": e.price_usdc.unwrap_or(config.base_price_usdc),
            })
        })
        .collect();

    serde_json::json!({
        "id": config.id,
        "name": config.name,
        "description": config.description,
        "type": config.resource_type.as_str(),
        "pricingModel": config.pricing_model,
        "basePriceUsdc": config.base_price_usdc,
        "endpoints": endpoints,
    })
    .to_string()
}

pub fn not_found_html(config: &ResourceConfig) -> String {
    page(
        "Not found",
        &format!(
            "<h1>Not found</h1><p>This path does not exist on <strong>{}</strong>. \
See <a href=\"/\">the resource overview</a> for the available endpoints.</p>",
            html_escape(&config.name)
        ),
    )
}

/// Compiler config for TypeScript sources run with `tsx`
pub fn default_tsconfig() -> String {
    r#"{
  "compilerOptions": {
    "target": "ES2022",
    "module": "ESNext",
    "moduleResolution": "Bundler",
    "strict": false,
    "esModuleInterop": true,
    "skipLibCheck": true,
    "resolveJsonModule": true,
    "jsx": "react-jsx",
    "jsxImportSource": "hono/jsx",
    "outDir": "dist"
  },
  "include": ["**/*.ts", "**/*.tsx"]
}
"#
    .to_string()
}

/// Minimal manifest used when the generated sources ship without one
pub fn default_package_json(resource_id: &str) -> String {
    let manifest = serde_json::json!({
        "name": format!("paygate-{}", resource_id),
        "version": "1.0.0",
        "private": true,
        "type": "module",
        "dependencies": {
            "hono": "^4.6.0",
            "@hono/node-server": "^1.13.0"
        }
    });
    // to_string_pretty on a Value cannot fail
    format!("{}\n", serde_json::to_string_pretty(&manifest).unwrap_or_default())
}

/// Build recipe. The base image carries node, tsx and the payment
/// middleware, so every resource starts from the same toolchain.
pub fn dockerfile(base_image: &str, port: u16, command: &[&str]) -> String {
    let command: Vec<String> = command.iter().map(|part| js_string(part)).collect();
    format!(
        r#"# Generated build recipe. User-supplied recipes are ignored.
FROM {base_image}
ARG RESOURCE_ID
ARG CREATOR_WALLET
ARG RESOURCE_TYPE
ARG PORT={port}
ENV NODE_ENV=production \
    RESOURCE_ID=${{RESOURCE_ID}} \
    CREATOR_WALLET=${{CREATOR_WALLET}} \
    RESOURCE_TYPE=${{RESOURCE_TYPE}} \
    PORT=${{PORT}}
WORKDIR /app
COPY . .
RUN npm install --omit=dev --no-audit --no-fund
EXPOSE {port}
HEALTHCHECK --interval=10s --timeout=5s --start-period=10s --retries=3 \
  CMD wget -qO- http://127.0.0.1:${{PORT}}/health || exit 1
CMD [{command}]
"#,
        command = command.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_all_tokens() {
        let out = render("{{A}} and {{B}} and {{A}}", &[("A", "x"), ("B", "y")]);
        assert_eq!(out, "x and y and x");
    }

    #[test]
    fn test_js_string_escapes_quotes() {
        assert_eq!(js_string("it's \"quoted\""), r#""it's \"quoted\"""#);
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<b>&'\"</b>"), "&lt;b&gt;&amp;&#39;&quot;&lt;/b&gt;");
    }

    #[test]
    fn test_paywall_page_shows_pricing_model() {
        let mut config = ResourceConfig {
            id: "r1".to_string(),
            name: "Tokens".to_string(),
            description: String::new(),
            creator_wallet: "0x1111111111111111111111111111111111111111".to_string(),
            resource_type: Default::default(),
            base_price_usdc: 0.002,
            pricing_model: PricingModel::PerToken,
            tags: vec![],
            env_vars: Default::default(),
            endpoints: vec![],
        };
        let html = paywall_html(&config);
        assert!(html.contains("0.002 USDC per token"));
        assert!(!html.contains("per request"));

        config.pricing_model = PricingModel::Flat;
        assert!(paywall_html(&config).contains("USDC flat fee"));
    }

    #[test]
    fn test_dockerfile_uses_base_image_and_port() {
        let recipe = dockerfile("paygate/base:1", 3001, &["tsx", "src/index.ts"]);
        assert!(recipe.contains("FROM paygate/base:1"));
        assert!(recipe.contains("EXPOSE 3001"));
        assert!(recipe.contains("ARG PORT=3001"));
        assert!(recipe.contains("/health"));
        assert!(recipe.contains(r#"CMD ["tsx", "src/index.ts"]"#));
        assert!(recipe.contains("RESOURCE_ID=${RESOURCE_ID}"));
    }
}
