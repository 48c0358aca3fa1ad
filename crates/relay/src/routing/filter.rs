//! Model-aware provider filtering.
//!
//! A provider's `model_mapping` keys act as prefix patterns (a trailing `*`
//! is an explicit wildcard; a bare key also prefix-matches). The filter
//! keeps the providers achieving the longest match for the requested model,
//! preserving input order among ties. No match at all falls through to the
//! whole set so routing can still decide.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::routing::ProviderInfo;

/// Length of the best pattern in `mapping` matching `model`, if any.
/// An empty mapping accepts any model at zero specificity.
pub fn match_len(mapping: &IndexMap<String, String>, model: &str) -> Option<usize> {
	if mapping.is_empty() {
		return Some(0);
	}
	mapping
		.keys()
		.filter_map(|key| {
			let prefix = key.strip_suffix('*').unwrap_or(key);
			model.starts_with(prefix).then_some(prefix.len())
		})
		.max()
}

/// Resolves the upstream model id for `model` through the mapping, using the
/// same longest-prefix rule. Unmapped models pass through unchanged.
pub fn map_model<'a>(mapping: &'a IndexMap<String, String>, model: &'a str) -> &'a str {
	mapping
		.iter()
		.filter_map(|(key, target)| {
			let prefix = key.strip_suffix('*').unwrap_or(key);
			model
				.starts_with(prefix)
				.then_some((prefix.len(), target.as_str()))
		})
		.max_by_key(|(len, _)| *len)
		.map(|(_, target)| target)
		.unwrap_or(model)
}

pub fn filter_by_model(
	model: &str,
	infos: &[Arc<ProviderInfo>],
) -> Vec<Arc<ProviderInfo>> {
	let scored: Vec<(usize, &Arc<ProviderInfo>)> = infos
		.iter()
		.filter_map(|info| {
			match_len(&info.proxy.model_mapping, model).map(|len| (len, info))
		})
		.collect();
	let best = scored.iter().map(|(len, _)| *len).max().unwrap_or(0);
	if best == 0 {
		// nothing specific matched; permissive fallback to the full slice
		return infos.to_vec();
	}
	scored
		.into_iter()
		.filter(|(len, _)| *len == best)
		.map(|(_, info)| info.clone())
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn mapping(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn wildcard_prefix_matches() {
		let m = mapping(&[("claude-sonnet-*", "x")]);
		assert_eq!(match_len(&m, "claude-sonnet-4-5"), Some("claude-sonnet-".len()));
		assert_eq!(match_len(&m, "gpt-4"), None);
	}

	#[test]
	fn bare_key_prefix_matches() {
		let m = mapping(&[("claude-3-opus", "x")]);
		assert_eq!(match_len(&m, "claude-3-opus-20240229"), Some("claude-3-opus".len()));
	}

	#[test]
	fn empty_mapping_accepts_anything() {
		let m = mapping(&[]);
		assert_eq!(match_len(&m, "whatever"), Some(0));
	}

	#[test]
	fn longest_prefix_wins_mapping() {
		let m = mapping(&[("claude-*", "generic"), ("claude-sonnet-*", "specific")]);
		assert_eq!(map_model(&m, "claude-sonnet-4-5"), "specific");
		assert_eq!(map_model(&m, "claude-opus-4"), "generic");
		assert_eq!(map_model(&m, "gpt-4"), "gpt-4");
	}
}
