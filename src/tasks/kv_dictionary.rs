//! Key-value dictionary placement task
//!
//! The model must emit a dictionary with a given number of entries and
//! place one specific entry at a specific index. Fully verifiable: scoring
//! checks the target entry's presence, its position, the entry count, and
//! the average key/value lengths, each with a smooth penalty around the
//! requested value.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{sample_id, seed_for_sample, TaskGenerator};
use crate::config::TaskConfig;
use crate::sample::{TaskInstance, Verdict};

const KEY_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const VALUE_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Deserialize)]
struct KvParams {
    #[serde(default = "default_num_entries")]
    num_entries: usize,
    #[serde(default = "default_key_length")]
    key_length: usize,
    #[serde(default = "default_value_length")]
    value_length: usize,
}

fn default_num_entries() -> usize { 20 }
fn default_key_length() -> usize { 32 }
fn default_value_length() -> usize { 32 }

impl KvParams {
    fn from_value(params: &Value) -> Result<Self> {
        if params.is_null() {
            return Ok(Self {
                num_entries: default_num_entries(),
                key_length: default_key_length(),
                value_length: default_value_length(),
            });
        }
        let parsed: Self = serde_json::from_value(params.clone())?;
        if parsed.num_entries < 2 {
            anyhow::bail!("kv_dictionary: num_entries must be at least 2");
        }
        if parsed.key_length == 0 || parsed.value_length == 0 {
            anyhow::bail!("kv_dictionary: key and value lengths must be positive");
        }
        Ok(parsed)
    }
}

fn random_string(rng: &mut StdRng, chars: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| chars[rng.gen_range(0..chars.len())] as char)
        .collect()
}

pub struct KvDictionaryTask;

impl TaskGenerator for KvDictionaryTask {
    fn task_type(&self) -> &'static str {
        "kv_dictionary"
    }

    fn generate(&self, task: &TaskConfig, base_seed: u64) -> Result<Vec<TaskInstance>> {
        let params = KvParams::from_value(&task.params)?;
        let mut instances = Vec::with_capacity(task.sample_count);
        for index in 0..task.sample_count {
            let id = sample_id(task, index);
            let mut rng = StdRng::seed_from_u64(seed_for_sample(base_seed, &id));

            let target_key = random_string(&mut rng, KEY_CHARS, params.key_length);
            let target_value = random_string(&mut rng, VALUE_CHARS, params.value_length);
            // Target position as a percentage, sampled away from the ends.
            let target_percent = 5 * rng.gen_range(1..=19);
            let target_index = ((target_percent as f64 / 100.0)
                * (params.num_entries - 1) as f64)
                .round() as usize;
            let target_index = target_index.min(params.num_entries - 1);

            let prompt = format!(
                "Generate a dictionary with the following requirements:\n\
                 - Total entries: {num}\n\
                 - MUST include the entry: \"{key}\": \"{value}\"\n\
                 - That entry must be placed at index {index} (0-based)\n\
                 - All other entries follow these rules:\n\
                 \x20 * Keys are random strings of length {key_len} using ONLY uppercase letters (A-Z) and underscores (_)\n\
                 \x20 * Values are random strings of length {value_len} using ONLY lowercase letters (a-z) and digits (0-9)\n\
                 \x20 * No spaces or other special characters in keys or values\n\
                 - Output ONLY the dictionary, on a single line, as valid JSON\n\
                 - Do not include code fences or explanations",
                num = params.num_entries,
                key = target_key,
                value = target_value,
                index = target_index,
                key_len = params.key_length,
                value_len = params.value_length,
            );

            instances.push(TaskInstance {
                sample_id: id,
                task_type: self.task_type().to_string(),
                target_length: task.target_length.clone(),
                prompt,
                ground_truth: json!({
                    "target_key": target_key,
                    "target_value": target_value,
                    "target_index": target_index,
                    "num_entries": params.num_entries,
                    "key_length": params.key_length,
                    "value_length": params.value_length,
                }),
            });
        }
        Ok(instances)
    }

    fn is_verifiable(&self) -> bool {
        true
    }

    fn verify(&self, output: &str, ground_truth: &Value) -> Option<Verdict> {
        Some(Verdict::Score(score_output(output, ground_truth)))
    }
}

/// Smooth penalty in (0, 1]: 1 at zero deviation, 1/2 at `scale`.
fn proximity(diff: f64, scale: f64) -> f64 {
    let scale = scale.max(1.0);
    1.0 / (1.0 + (diff / scale).powi(2))
}

/// Score one output. Unparseable or missing-target outputs score zero.
fn score_output(output: &str, ground_truth: &Value) -> f64 {
    let Some(entries) = extract_entries(output) else {
        return 0.0;
    };
    let (Some(target_key), Some(target_value)) = (
        ground_truth.get("target_key").and_then(|v| v.as_str()),
        ground_truth.get("target_value").and_then(|v| v.as_str()),
    ) else {
        return 0.0;
    };
    let target_index = ground_truth
        .get("target_index")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as f64;
    let expected_total = ground_truth
        .get("num_entries")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as f64;
    let key_length = ground_truth
        .get("key_length")
        .and_then(|v| v.as_u64())
        .unwrap_or(default_key_length() as u64) as f64;
    let value_length = ground_truth
        .get("value_length")
        .and_then(|v| v.as_u64())
        .unwrap_or(default_value_length() as u64) as f64;

    let Some(actual_index) = entries.iter().position(|(k, _)| k == target_key) else {
        return 0.0;
    };
    if !entries.iter().any(|(_, v)| v == target_value) {
        return 0.0;
    }

    let actual_total = entries.len() as f64;
    // ±25% tolerance on position and count before the score halves.
    let position_score = proximity((actual_index as f64 - target_index).abs(), expected_total * 0.25);
    let entry_num_score = proximity((actual_total - expected_total).abs(), expected_total * 0.25);

    let avg_key_len = entries.iter().map(|(k, _)| k.len()).sum::<usize>() as f64 / actual_total;
    let avg_val_len = entries.iter().map(|(_, v)| v.len()).sum::<usize>() as f64 / actual_total;
    let key_len_score = proximity((avg_key_len - key_length).abs(), key_length * 0.25);
    let val_len_score = proximity((avg_val_len - value_length).abs(), value_length * 0.25);
    let avg_length_score = (key_len_score + val_len_score) / 2.0;

    // Harmonic mean: any one dimension collapsing drags the total down.
    if position_score == 0.0 || entry_num_score == 0.0 || avg_length_score == 0.0 {
        return 0.0;
    }
    3.0 / (1.0 / position_score + 1.0 / entry_num_score + 1.0 / avg_length_score)
}

/// Pull the dictionary out of the response, tolerating single quotes,
/// trailing commas, and surrounding prose.
fn extract_entries(output: &str) -> Option<Vec<(String, String)>> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if start >= end {
        return None;
    }
    let mut dict_str = output[start..=end].replace('\'', "\"");
    if let Some(pos) = dict_str.rfind(",}") {
        dict_str.replace_range(pos..pos + 2, "}");
    }
    let parsed: Value = serde_json::from_str(&dict_str).ok()?;
    let object = parsed.as_object()?;
    Some(
        object
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect(),
    )
}
