//! Heuristic token estimation and per-model budget planning.
//!
//! Counting is intentionally approximate: one token per ~4 runes of
//! ASCII-heavy text, ~3.2 for text with a large non-ASCII share. Real
//! tokenizers would add a dependency without materially improving the
//! prompt-pack packing decisions.

use std::collections::HashMap;

/// Limits of a known model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: &'static str,
    /// Full session context window.
    pub max_context_tokens: u32,
    /// Budget consumed by system/service tokens.
    pub system_overhead_tokens: u32,
    /// Reserve for user questions/instructions, percent of total.
    pub default_reserve_pct: u32,
}

/// Registry of model limits keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    by_id: HashMap<String, ModelSpec>,
}

impl ModelRegistry {
    /// Registry seeded with the built-in model set. Deployments can insert
    /// overrides at startup.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut by_id = HashMap::new();
        for spec in [
            ModelSpec {
                id: "openai:gpt-4",
                max_context_tokens: 8_192,
                system_overhead_tokens: 500,
                default_reserve_pct: 10,
            },
            ModelSpec {
                id: "openai:gpt-4o",
                max_context_tokens: 128_000,
                system_overhead_tokens: 1_000,
                default_reserve_pct: 10,
            },
            ModelSpec {
                id: "deepseek:chat",
                max_context_tokens: 64_000,
                system_overhead_tokens: 600,
                default_reserve_pct: 10,
            },
            ModelSpec {
                id: "deepseek:coder",
                max_context_tokens: 200_000,
                system_overhead_tokens: 1_000,
                default_reserve_pct: 10,
            },
        ] {
            by_id.insert(spec.id.to_string(), spec);
        }
        Self { by_id }
    }

    pub fn insert(&mut self, id: &str, spec: ModelSpec) {
        self.by_id.insert(id.to_string(), spec);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.by_id.get(id)
    }
}

/// Estimate the token count of a text for the given model.
///
/// Normalizes first (BOM stripped, CRLF/CR to LF), soft-wraps very long
/// lines at natural breakpoints to avoid overestimating dense text, then
/// divides the rune count by the per-model ratio, rounding up (minimum 1
/// for non-empty input).
#[must_use]
pub fn count_tokens(text: &str, _model_id: &str) -> u32 {
    let norm = soft_wrap(&normalize(text), 2000);
    let runes = norm.chars().count();
    if runes == 0 {
        return 0;
    }
    let ratio = if non_ascii_share(&norm) > 0.2 { 3.2 } else { 4.0 };
    let toks = (runes as f64 / ratio).ceil() as u32;
    toks.max(1)
}

/// Sum of token estimates over several parts.
#[must_use]
pub fn count_for_parts(parts: &[&str], model_id: &str) -> u32 {
    parts.iter().map(|p| count_tokens(p, model_id)).sum()
}

fn normalize(s: &str) -> String {
    let s = s.strip_prefix('\u{FEFF}').unwrap_or(s);
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Insert a newline after roughly `max` runes, but only on natural
/// breakpoints so words never split.
fn soft_wrap(s: &str, max: usize) -> String {
    if max == 0 {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + s.len() / max + 1);
    let mut line = 0usize;
    for c in s.chars() {
        out.push(c);
        line += 1;
        if line >= max && matches!(c, ' ' | ',' | ';' | '}' | ']' | ')') {
            out.push('\n');
            line = 0;
        }
    }
    out
}

fn non_ascii_share(s: &str) -> f64 {
    let mut total = 0usize;
    let mut non_ascii = 0usize;
    for c in s.chars() {
        total += 1;
        if !c.is_ascii() {
            non_ascii += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    non_ascii as f64 / total as f64
}

/// Computed token budget split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub total: u32,
    pub reserve: u32,
    pub usable: u32,
}

/// Budget planner over a model registry, with per-profile fallbacks for
/// unknown models.
#[derive(Debug, Clone)]
pub struct Planner {
    pub registry: ModelRegistry,
    pub fallback_short: u32,
    pub fallback_full: u32,
    pub default_reserve_pct: u32,
}

impl Planner {
    #[must_use]
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            fallback_short: 50_000,
            fallback_full: 200_000,
            default_reserve_pct: 10,
        }
    }

    /// Compute (total, reserve, usable) for a profile and model id.
    #[must_use]
    pub fn budget(&self, profile: &str, model_id: &str) -> Budget {
        if let Some(spec) = self.registry.get(model_id) {
            if spec.max_context_tokens > 0 {
                let total = spec.max_context_tokens - spec.system_overhead_tokens;
                let pct = if spec.default_reserve_pct > 0 {
                    spec.default_reserve_pct
                } else {
                    self.default_reserve_pct
                };
                let reserve = total * pct / 100;
                return Budget {
                    total,
                    reserve,
                    usable: total - reserve,
                };
            }
        }
        let total = if profile.eq_ignore_ascii_case("full") {
            self.fallback_full
        } else {
            self.fallback_short
        };
        let reserve = total * self.default_reserve_pct / 100;
        Budget {
            total,
            reserve,
            usable: total - reserve,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(count_tokens("", "any"), 0);
    }

    #[test]
    fn ascii_ratio_is_four_chars_per_token() {
        // 400 ASCII chars -> 100 tokens.
        let text = "a".repeat(400);
        assert_eq!(count_tokens(&text, "any"), 100);
        assert_eq!(count_tokens("x", "any"), 1);
    }

    #[test]
    fn non_ascii_text_uses_denser_ratio() {
        let cyrillic: String = "ж".repeat(320);
        // 320 runes / 3.2 = 100.
        assert_eq!(count_tokens(&cyrillic, "any"), 100);
    }

    #[test]
    fn normalization_strips_bom_and_crlf() {
        let text = "\u{FEFF}line1\r\nline2\rline3";
        assert_eq!(normalize(text), "line1\nline2\nline3");
    }

    #[test]
    fn count_for_parts_sums() {
        let a = "a".repeat(40);
        let b = "b".repeat(40);
        assert_eq!(count_for_parts(&[&a, &b], "any"), 20);
    }

    #[test]
    fn budget_from_registry() {
        let planner = Planner::new(ModelRegistry::with_defaults());
        let b = planner.budget("short", "openai:gpt-4o");
        assert_eq!(b.total, 127_000);
        assert_eq!(b.reserve, 12_700);
        assert_eq!(b.usable, 114_300);
    }

    #[test]
    fn budget_fallback_by_profile() {
        let planner = Planner::new(ModelRegistry::with_defaults());
        let short = planner.budget("short", "unknown:model");
        assert_eq!(short.total, 50_000);
        assert_eq!(short.usable, 45_000);
        let rag = planner.budget("rag", "unknown:model");
        assert_eq!(rag.total, 50_000);
        let full = planner.budget("FULL", "unknown:model");
        assert_eq!(full.total, 200_000);
        assert_eq!(full.usable, 180_000);
    }
}
