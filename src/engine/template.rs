//! `{{...}}` string templates for URLs, headers and text bodies.
//!
//! Supported expressions:
//! - `base_url`, `vu`, `iter`, `scenario`
//! - `rand_int:MIN:MAX` (inclusive, drawn from the VU's random source)
//! - `env:NAME` (resolved once, when the template is compiled)
//! - `var:NAME` or a bare `NAME`: a value captured earlier in the iteration

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    BaseUrl,
    Vu,
    Iteration,
    Scenario,
    RandInt(i64, i64),
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<Part>,
}

/// Per-iteration variables, cleared between iterations.
#[derive(Debug, Default, Clone)]
pub struct IterationScope {
    vars: HashMap<String, String>,
}

impl IterationScope {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn clear(&mut self) {
        self.vars.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

pub struct TemplateContext<'a> {
    pub base_url: &'a str,
    pub vu: u64,
    pub iteration: u64,
    pub scenario: &'a str,
    pub scope: &'a IterationScope,
}

fn invalid(template: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidTemplate {
        template: template.to_string(),
        reason: reason.into(),
    }
}

fn parse_expr(template: &str, expr: &str) -> Result<Part, ConfigError> {
    let expr = expr.trim();
    match expr {
        "" => return Err(invalid(template, "empty expression")),
        "base_url" => return Ok(Part::BaseUrl),
        "vu" => return Ok(Part::Vu),
        "iter" | "iteration" => return Ok(Part::Iteration),
        "scenario" => return Ok(Part::Scenario),
        _ => {}
    }
    if let Some(range) = expr.strip_prefix("rand_int:") {
        let (lo, hi) = range
            .split_once(':')
            .ok_or_else(|| invalid(template, "rand_int needs MIN:MAX"))?;
        let lo: i64 = lo
            .trim()
            .parse()
            .map_err(|_| invalid(template, format!("bad rand_int bound `{}`", lo)))?;
        let hi: i64 = hi
            .trim()
            .parse()
            .map_err(|_| invalid(template, format!("bad rand_int bound `{}`", hi)))?;
        if lo > hi {
            return Err(invalid(template, "rand_int MIN is greater than MAX"));
        }
        return Ok(Part::RandInt(lo, hi));
    }
    if let Some(name) = expr.strip_prefix("env:") {
        return Ok(Part::Literal(std::env::var(name.trim()).unwrap_or_default()));
    }
    let name = expr.strip_prefix("var:").unwrap_or(expr).trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid(template, format!("unknown expression `{}`", expr)));
    }
    Ok(Part::Var(name.to_string()))
}

impl Template {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| invalid(template, "unclosed `{{`"))?;
            parts.push(parse_expr(template, &after[..close])?);
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn render(&self, ctx: &TemplateContext<'_>, rng: &mut StdRng) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::BaseUrl => out.push_str(ctx.base_url),
                Part::Vu => out.push_str(&ctx.vu.to_string()),
                Part::Iteration => out.push_str(&ctx.iteration.to_string()),
                Part::Scenario => out.push_str(ctx.scenario),
                Part::RandInt(lo, hi) => out.push_str(&rng.gen_range(*lo..=*hi).to_string()),
                Part::Var(name) => out.push_str(ctx.scope.get(name).unwrap_or_default()),
            }
        }
        out
    }
}
