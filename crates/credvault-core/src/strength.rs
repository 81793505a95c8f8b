//! Master password strength policy.
//!
//! Composite score out of 100:
//! - length: 2 points per character, capped at 32
//! - character classes (lower, upper, digit, symbol): 8 points each
//! - entropy estimate over distinct characters: 1 point per 2 bits, capped at 36

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub min_classes: u32,
    pub min_score: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 12,
            min_classes: 3,
            min_score: 75,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrengthReport {
    pub length: usize,
    pub classes: u32,
    pub entropy_bits: f64,
    pub score: u32,
    /// Empty when the password is acceptable.
    pub problems: Vec<String>,
}

impl StrengthReport {
    pub fn is_acceptable(&self) -> bool {
        self.problems.is_empty()
    }
}

pub fn assess(password: &str, policy: &PasswordPolicy) -> StrengthReport {
    let length = password.chars().count();

    let mut lower = false;
    let mut upper = false;
    let mut digit = false;
    let mut symbol = false;
    for c in password.chars() {
        if c.is_lowercase() {
            lower = true;
        } else if c.is_uppercase() {
            upper = true;
        } else if c.is_ascii_digit() {
            digit = true;
        } else {
            symbol = true;
        }
    }
    let classes = [lower, upper, digit, symbol].iter().filter(|b| **b).count() as u32;

    let pool = [(lower, 26u32), (upper, 26), (digit, 10), (symbol, 33)]
        .iter()
        .filter(|(present, _)| *present)
        .map(|(_, size)| size)
        .sum::<u32>()
        .max(1);
    let distinct = password.chars().collect::<HashSet<_>>().len();
    let entropy_bits = distinct as f64 * f64::from(pool).log2();

    let length_points = (length.min(16) * 2) as u32;
    let class_points = classes * 8;
    let entropy_points = ((entropy_bits / 2.0) as u32).min(36);
    let score = length_points + class_points + entropy_points;

    let mut problems = Vec::new();
    if length < policy.min_length {
        problems.push(format!("use at least {} characters", policy.min_length));
    }
    if classes < policy.min_classes {
        problems.push(format!(
            "mix at least {} of: lowercase, uppercase, digits, symbols",
            policy.min_classes
        ));
    }
    if score < policy.min_score {
        problems.push(format!("strength score {score} is below {}", policy.min_score));
    }

    StrengthReport {
        length,
        classes,
        entropy_bits,
        score,
        problems,
    }
}
