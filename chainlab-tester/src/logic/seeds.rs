use anyhow::{Context, Result, bail};

/// Resolve a list of CLI seed arguments into run seeds.
///
/// Supports decimal integers (negative values use their magnitude), `0x`-prefixed hex,
/// and the keyword `default` for the engine's configured seed. Duplicates are dropped
/// in order of first appearance.
pub fn resolve_seed_inputs(tokens: &[String], default_seed: u64) -> Result<Vec<u64>> {
    let mut seeds: Vec<u64> = Vec::new();

    for token in tokens {
        if token.is_empty() {
            continue;
        }

        let seed = if token.eq_ignore_ascii_case("default") {
            default_seed
        } else if let Some(hex) = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            u64::from_str_radix(&hex.replace('_', ""), 16)
                .with_context(|| format!("invalid hex seed: {token}"))?
        } else if let Ok(value) = token.parse::<i64>() {
            value.unsigned_abs()
        } else if let Ok(value) = token.parse::<u64>() {
            value
        } else {
            bail!("Unrecognized seed token: {token}");
        };

        if !seeds.contains(&seed) {
            seeds.push(seed);
        }
    }

    if seeds.is_empty() {
        seeds.push(default_seed);
    }

    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn resolves_numeric_hex_and_keywords() {
        let seeds = resolve_seed_inputs(&tokens(&["42", "-7", "0xFF", "default"]), 9).unwrap();
        assert_eq!(seeds, vec![42, 7, 255, 9]);
    }

    #[test]
    fn deduplicates_and_falls_back() {
        assert_eq!(
            resolve_seed_inputs(&tokens(&["5", "0x5", "5"]), 1).unwrap(),
            vec![5]
        );
        assert_eq!(resolve_seed_inputs(&[], 1).unwrap(), vec![1]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(resolve_seed_inputs(&tokens(&["CL-ORANGE42"]), 1).is_err());
        assert!(resolve_seed_inputs(&tokens(&["0xZZ"]), 1).is_err());
    }
}
