use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::strng;
use crate::strng::Strng;

/// Cost per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRate {
	pub input: f64,
	pub output: f64,
}

/// A price band selected by input-token-count threshold.
/// `threshold == 0` is the catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingTier {
	#[serde(default, deserialize_with = "crate::serdes::de_u64_separators")]
	pub threshold: u64,
	pub input: f64,
	pub output: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ModelPricing {
	pub tiers: Vec<PricingTier>,
	/// Alias-specific rates that bypass tier selection entirely.
	pub overrides: HashMap<Strng, PriceRate>,
}

#[derive(Debug, Clone, Default)]
struct ProviderPricing {
	models: HashMap<Strng, ModelPricing>,
	/// alias -> canonical
	aliases: HashMap<Strng, Strng>,
}

/// Immutable pricing lookup, built once at startup from configuration.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
	providers: HashMap<Strng, ProviderPricing>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPrice {
	pub canonical: Strng,
	pub rate: PriceRate,
	/// Set when the model was matched by edit distance rather than exactly.
	pub is_estimate: bool,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PricingError {
	#[error("unknown provider: {0}")]
	UnknownProvider(Strng),
	#[error("no pricing for model: {0}")]
	UnknownModel(Strng),
	#[error("model {0} has no tier covering the request and no override")]
	NoApplicableTier(Strng),
}

/// Names within this edit distance of a configured model (same provider) are
/// close enough to price as an estimate.
const FUZZY_DISTANCE: usize = 2;

impl PriceTable {
	pub fn insert(&mut self, provider: Strng, model: Strng, aliases: &[Strng], pricing: ModelPricing) {
		let p = self.providers.entry(provider).or_default();
		for alias in aliases {
			p.aliases.insert(alias.clone(), model.clone());
		}
		p.models.insert(model, pricing);
	}

	/// Map a requested model name to its canonical configured name.
	/// Aliases share pricing and rate-limit buckets with their canonical name.
	pub fn canonical(&self, provider: &Strng, requested: &Strng) -> Option<Strng> {
		let p = self.providers.get(provider)?;
		if p.models.contains_key(requested) {
			return Some(requested.clone());
		}
		p.aliases.get(requested).cloned()
	}

	/// Effective per-million rate for `(provider, requested_model, input_tokens)`.
	/// Resolution: canonical mapping, then an alias override if one names the
	/// requested model, then tier selection (descending threshold, first tier
	/// with `threshold == 0` or `input_tokens <= threshold`).
	pub fn resolve(
		&self,
		provider: &Strng,
		requested: &Strng,
		input_tokens: u64,
	) -> Result<ResolvedPrice, PricingError> {
		let p = self
			.providers
			.get(provider)
			.ok_or_else(|| PricingError::UnknownProvider(provider.clone()))?;
		let canonical = self
			.canonical(provider, requested)
			.ok_or_else(|| PricingError::UnknownModel(requested.clone()))?;
		let pricing = p
			.models
			.get(&canonical)
			.ok_or_else(|| PricingError::UnknownModel(requested.clone()))?;

		if let Some(rate) = pricing.overrides.get(requested) {
			return Ok(ResolvedPrice {
				canonical,
				rate: *rate,
				is_estimate: false,
			});
		}

		for tier in pricing
			.tiers
			.iter()
			.sorted_by(|a, b| b.threshold.cmp(&a.threshold))
		{
			if tier.threshold == 0 || input_tokens <= tier.threshold {
				return Ok(ResolvedPrice {
					canonical,
					rate: PriceRate {
						input: tier.input,
						output: tier.output,
					},
					is_estimate: false,
				});
			}
		}
		Err(PricingError::NoApplicableTier(canonical))
	}

	/// Like [`resolve`], but when the exact name is unknown, fall back to the
	/// closest configured name (canonical or alias) of the same provider
	/// within a small edit distance, flagged as an estimate.
	pub fn resolve_fuzzy(
		&self,
		provider: &Strng,
		requested: &Strng,
		input_tokens: u64,
	) -> Result<ResolvedPrice, PricingError> {
		match self.resolve(provider, requested, input_tokens) {
			Err(PricingError::UnknownModel(_)) => {},
			other => return other,
		}
		let p = self
			.providers
			.get(provider)
			.ok_or_else(|| PricingError::UnknownProvider(provider.clone()))?;
		let nearest = p
			.models
			.keys()
			.chain(p.aliases.keys())
			.map(|name| (edit_distance(requested, name), name))
			.min_by_key(|(d, _)| *d);
		match nearest {
			Some((d, name)) if d <= FUZZY_DISTANCE => {
				let near = strng::new(name);
				let resolved = self.resolve(provider, &near, input_tokens)?;
				Ok(ResolvedPrice {
					is_estimate: true,
					..resolved
				})
			},
			_ => Err(PricingError::UnknownModel(requested.clone())),
		}
	}

	pub fn providers(&self) -> impl Iterator<Item = &Strng> {
		self.providers.keys()
	}

	pub fn models(&self, provider: &Strng) -> Vec<Strng> {
		self
			.providers
			.get(provider)
			.map(|p| p.models.keys().cloned().collect())
			.unwrap_or_default()
	}
}

fn edit_distance(a: &str, b: &str) -> usize {
	let a: Vec<char> = a.chars().collect();
	let b: Vec<char> = b.chars().collect();
	let mut prev: Vec<usize> = (0..=b.len()).collect();
	let mut cur = vec![0usize; b.len() + 1];
	for (i, ca) in a.iter().enumerate() {
		cur[0] = i + 1;
		for (j, cb) in b.iter().enumerate() {
			let sub = prev[j] + usize::from(ca != cb);
			cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
		}
		std::mem::swap(&mut prev, &mut cur);
	}
	prev[b.len()]
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::strng;

	fn table() -> PriceTable {
		let mut t = PriceTable::default();
		t.insert(
			strng::literal!("openai"),
			strng::literal!("gpt-4o"),
			&[strng::literal!("gpt-4o-2024-05-13")],
			ModelPricing {
				tiers: vec![PricingTier {
					threshold: 0,
					input: 2.5,
					output: 10.0,
				}],
				overrides: HashMap::new(),
			},
		);
		t.insert(
			strng::literal!("gemini"),
			strng::literal!("gemini-2.5-pro"),
			&[],
			ModelPricing {
				tiers: vec![
					PricingTier {
						threshold: 0,
						input: 2.5,
						output: 15.0,
					},
					PricingTier {
						threshold: 200_000,
						input: 1.25,
						output: 10.0,
					},
				],
				overrides: HashMap::new(),
			},
		);
		let mut overrides = HashMap::new();
		overrides.insert(
			strng::literal!("claude-3-5-haiku"),
			PriceRate {
				input: 0.8,
				output: 4.0,
			},
		);
		t.insert(
			strng::literal!("anthropic"),
			strng::literal!("claude-sonnet-4"),
			&[strng::literal!("claude-3-5-haiku")],
			ModelPricing {
				tiers: vec![PricingTier {
					threshold: 0,
					input: 3.0,
					output: 15.0,
				}],
				overrides,
			},
		);
		t
	}

	#[test]
	fn alias_resolves_to_canonical_pricing() {
		let t = table();
		let r = t
			.resolve(
				&strng::literal!("openai"),
				&strng::literal!("gpt-4o-2024-05-13"),
				100,
			)
			.unwrap();
		assert_eq!(r.canonical, "gpt-4o");
		assert_eq!(r.rate.input, 2.5);
		assert!(!r.is_estimate);
	}

	#[test]
	fn tier_selection_by_input_tokens() {
		let t = table();
		let p = strng::literal!("gemini");
		let m = strng::literal!("gemini-2.5-pro");
		let small = t.resolve(&p, &m, 100_000).unwrap();
		assert_eq!(small.rate.input, 1.25);
		let large = t.resolve(&p, &m, 300_000).unwrap();
		assert_eq!(large.rate.input, 2.5);
		// Monotone: growing past the threshold never gets cheaper.
		assert!(large.rate.input >= small.rate.input);
	}

	#[test]
	fn alias_override_beats_tiers() {
		let t = table();
		let r = t
			.resolve(
				&strng::literal!("anthropic"),
				&strng::literal!("claude-3-5-haiku"),
				10,
			)
			.unwrap();
		assert_eq!(r.rate.input, 0.8);
		// The canonical name itself still uses tier pricing.
		let r = t
			.resolve(
				&strng::literal!("anthropic"),
				&strng::literal!("claude-sonnet-4"),
				10,
			)
			.unwrap();
		assert_eq!(r.rate.input, 3.0);
	}

	#[test]
	fn fuzzy_fallback_flags_estimate() {
		let t = table();
		let r = t
			.resolve_fuzzy(&strng::literal!("openai"), &strng::literal!("gpt-4o1"), 10)
			.unwrap();
		assert!(r.is_estimate);
		assert_eq!(r.canonical, "gpt-4o");

		// Too far away: fail closed.
		let err = t
			.resolve_fuzzy(
				&strng::literal!("openai"),
				&strng::literal!("totally-different"),
				10,
			)
			.unwrap_err();
		assert_eq!(err, PricingError::UnknownModel(strng::literal!("totally-different")));
	}

	#[test]
	fn edit_distance_basics() {
		assert_eq!(edit_distance("gpt-4o", "gpt-4o"), 0);
		assert_eq!(edit_distance("gpt-4o", "gpt-4"), 1);
		assert_eq!(edit_distance("abc", "xyz"), 3);
	}
}
