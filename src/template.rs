//! Response body templating.
//!
//! A `body_template` goes through a single function-substitution pass when the
//! mock is registered, producing a fixed JSON body. Substitution deliberately
//! happens at registration time, not per matched request, so a long-lived
//! mock's timestamps are frozen at load.

use anyhow::{anyhow, bail, Result};
use chrono::{Duration, Local, SecondsFormat, Utc};
use serde_json::Value;

/// Render a response body template into a JSON document.
///
/// Recognized functions, written as `{{ name }}` or `{{ name "arg" }}`:
/// `now`, `now_rfc3339`, `now_add_rfc3339 <duration>`, `now_utc_rfc3339`.
/// An unresolvable function or a non-JSON result fails registration.
pub fn render(template: &str) -> Result<Value> {
    let rendered = substitute(template)?;
    load_document(&rendered)
}

fn substitute(template: &str) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| anyhow!("unterminated template expression"))?;
        out.push_str(&eval_call(after[..end].trim())?);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn eval_call(call: &str) -> Result<String> {
    let (name, arg) = split_call(call);
    match name {
        "now" => Ok(Utc::now().to_string()),
        "now_rfc3339" => Ok(Local::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        "now_utc_rfc3339" => Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        "now_add_rfc3339" => {
            let arg = arg.ok_or_else(|| anyhow!("now_add_rfc3339 requires a duration argument"))?;
            let span = parse_duration(arg)?;
            Ok((Utc::now() + span).to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        other => Err(anyhow!("unknown template function: {}", other)),
    }
}

/// Split `name`, `name arg`, `name "arg"` or `name(arg)` into name and
/// optional argument.
fn split_call(call: &str) -> (&str, Option<&str>) {
    let call = call.strip_suffix("()").unwrap_or(call);

    let (name, arg) = if let Some(open) = call.find('(') {
        let arg = call[open + 1..].strip_suffix(')').unwrap_or(&call[open + 1..]);
        (&call[..open], arg.trim())
    } else {
        match call.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (call, ""),
        }
    };

    let arg = arg.trim_matches('"').trim_matches('\'');
    if arg.is_empty() {
        (name.trim(), None)
    } else {
        (name.trim(), Some(arg))
    }
}

/// Parse a duration string such as `300ms`, `1h30m` or `-2h45m`.
/// Units: `ns`, `us`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(src: &str) -> Result<Duration> {
    let (negative, mut rest) = match src.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, src.strip_prefix('+').unwrap_or(src)),
    };

    if rest.is_empty() {
        bail!("empty duration");
    }

    let mut total_ns: i64 = 0;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| anyhow!("missing unit in duration '{}'", src))?;
        if num_end == 0 {
            bail!("invalid duration '{}'", src);
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| anyhow!("invalid number in duration '{}'", src))?;

        let unit_end = rest[num_end..]
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .map(|i| num_end + i)
            .unwrap_or(rest.len());
        let unit_ns = match &rest[num_end..unit_end] {
            "ns" => 1.0,
            "us" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3_600.0 * 1_000_000_000.0,
            unit => bail!("unknown duration unit '{}' in '{}'", unit, src),
        };

        total_ns += (value * unit_ns) as i64;
        rest = &rest[unit_end..];
    }

    if negative {
        total_ns = -total_ns;
    }
    Ok(Duration::nanoseconds(total_ns))
}

/// Accept the rendered body as JSON, falling back to YAML for convenience.
fn load_document(src: &str) -> Result<Value> {
    let trimmed = src.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return serde_json::from_str(src)
            .map_err(|e| anyhow!("rendered template is not valid json: {}", e));
    }
    serde_yaml::from_str(src).map_err(|e| anyhow!("rendered template is not a document: {}", e))
}
