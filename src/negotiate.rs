use std::collections::{BTreeMap, BTreeSet};

use semver::Version;

use crate::error::BrokerError;
use crate::models::{
    Incompatibility, NegotiationResult, PairwiseEntry, RequiredProtocol, SessionCapabilities,
};
use crate::registry::parse_version;

/// Compute the protocol-version intersection and feature diff for two or
/// more participants. Given identical advertisements the result is
/// byte-identical: protocol names ascend, version lists descend, and every
/// map is BTree-ordered.
pub fn negotiate(
    participants: &[(String, SessionCapabilities)],
    required: &[RequiredProtocol],
) -> Result<NegotiationResult, BrokerError> {
    if participants.len() < 2 {
        return Err(BrokerError::Validation(
            "negotiation needs at least two sessions".to_string(),
        ));
    }

    let mut names: BTreeSet<&str> = BTreeSet::new();
    for (_, caps) in participants {
        names.extend(caps.protocols.keys().map(String::as_str));
    }

    let mut supported: BTreeMap<String, String> = BTreeMap::new();
    let mut incompatibilities: Vec<Incompatibility> = Vec::new();

    for name in names {
        let mut common: Option<BTreeSet<Version>> = None;
        for (_, caps) in participants {
            let versions: BTreeSet<Version> = caps
                .protocols
                .get(name)
                .map(|vs| {
                    vs.iter()
                        .map(|v| parse_version(v))
                        .collect::<Result<_, _>>()
                })
                .transpose()?
                .unwrap_or_default();
            common = Some(match common {
                None => versions,
                Some(prev) => prev.intersection(&versions).cloned().collect(),
            });
        }
        let common = common.unwrap_or_default();

        match common.iter().max() {
            Some(best) => {
                supported.insert(name.to_string(), best.to_string());
            }
            None => {
                incompatibilities.push(incompatibility(name, participants));
            }
        }
    }

    for req in required {
        let missing: Vec<&str> = participants
            .iter()
            .filter(|(_, caps)| {
                !caps
                    .protocols
                    .get(&req.name)
                    .is_some_and(|vs| vs.iter().any(|v| v == &req.version))
            })
            .map(|(sid, _)| sid.as_str())
            .collect();
        if !missing.is_empty() {
            supported.remove(&req.name);
            incompatibilities.push(Incompatibility {
                protocol: req.name.clone(),
                versions: advertised_versions(&req.name, participants),
                suggestion: Some(format!(
                    "required protocol {} {} is missing from {}",
                    req.name,
                    req.version,
                    missing.join(", ")
                )),
            });
        }
    }

    incompatibilities.sort_by(|a, b| a.protocol.cmp(&b.protocol));
    incompatibilities.dedup_by(|a, b| a.protocol == b.protocol);

    let all_features: BTreeSet<String> = participants
        .iter()
        .flat_map(|(_, caps)| caps.features.iter().cloned())
        .collect();
    let common_features: BTreeSet<String> = participants
        .iter()
        .fold(all_features.clone(), |acc, (_, caps)| {
            acc.intersection(&caps.features).cloned().collect()
        });
    let missing_features: BTreeMap<String, BTreeSet<String>> = participants
        .iter()
        .map(|(sid, caps)| {
            (
                sid.clone(),
                all_features.difference(&caps.features).cloned().collect(),
            )
        })
        .collect();

    let suggestion = incompatibilities.iter().find_map(|i| i.suggestion.clone());
    Ok(NegotiationResult {
        compatible: incompatibilities.is_empty(),
        supported_protocols: supported,
        common_features,
        missing_features,
        incompatibilities,
        suggestion,
    })
}

/// Pairwise matrix: the two-party result for every unordered pair, in
/// session-id order.
pub fn matrix(
    participants: &[(String, SessionCapabilities)],
) -> Result<Vec<PairwiseEntry>, BrokerError> {
    let mut sorted: Vec<&(String, SessionCapabilities)> = participants.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    for i in 0..sorted.len() {
        for j in (i + 1)..sorted.len() {
            let pair = [sorted[i].clone(), sorted[j].clone()];
            out.push(PairwiseEntry {
                a: pair[0].0.clone(),
                b: pair[1].0.clone(),
                result: negotiate(&pair, &[])?,
            });
        }
    }
    Ok(out)
}

fn advertised_versions(
    name: &str,
    participants: &[(String, SessionCapabilities)],
) -> BTreeMap<String, Vec<String>> {
    participants
        .iter()
        .map(|(sid, caps)| {
            let mut versions: Vec<Version> = caps
                .protocols
                .get(name)
                .map(|vs| vs.iter().filter_map(|v| Version::parse(v).ok()).collect())
                .unwrap_or_default();
            versions.sort_by(|a, b| b.cmp(a));
            (
                sid.clone(),
                versions.into_iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

fn incompatibility(name: &str, participants: &[(String, SessionCapabilities)]) -> Incompatibility {
    let versions = advertised_versions(name, participants);
    // When one side simply lags, name the session that should upgrade.
    let best = versions
        .values()
        .flat_map(|vs| vs.iter())
        .filter_map(|v| Version::parse(v).ok())
        .max();
    let suggestion = best.map(|best| {
        let laggards: Vec<&str> = versions
            .iter()
            .filter(|(_, vs)| !vs.iter().any(|v| v == &best.to_string()))
            .map(|(sid, _)| sid.as_str())
            .collect();
        if laggards.is_empty() {
            format!("no common version of {name}")
        } else {
            format!(
                "upgrade {} to {} {}",
                laggards.join(", "),
                name,
                best
            )
        }
    });
    Incompatibility {
        protocol: name.to_string(),
        versions,
        suggestion,
    }
}
