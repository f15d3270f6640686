//! Kubernetes resource quantity parsing
//!
//! Handles the subset of the quantity grammar that appears in pod requests
//! and quota values: binary suffixes (`Ki`..`Ei`), decimal suffixes
//! (`n u m k M G T P E`), exponent form (`1e3`) and bare numbers.

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 9] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

const BYTES_PER_GIB: f64 = 1_073_741_824.0;

/// Parse a quantity into base units (cores for CPU, bytes for memory)
pub fn parse_quantity(input: &str) -> Option<f64> {
    let s = input.trim();
    if s.is_empty() || !s.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == '+') {
        return None;
    }

    // Bare numbers and exponent form ("1e3", "1.5E2")
    if let Ok(v) = s.parse::<f64>() {
        return v.is_finite().then_some(v);
    }

    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))?;

    let value: f64 = number.parse().ok()?;
    let scaled = value * multiplier;
    (scaled.is_finite() && scaled >= 0.0).then_some(scaled)
}

/// Parse a CPU quantity into cores (`500m` = 0.5)
pub fn parse_cpu(input: &str) -> Option<f64> {
    parse_quantity(input)
}

/// Parse a memory quantity into GiB-based gigabytes (`2Gi` = 2.0)
pub fn parse_memory_gb(input: &str) -> Option<f64> {
    parse_quantity(input).map(|bytes| bytes / BYTES_PER_GIB)
}

/// Multiply a quantity, keeping its original suffix (`8Gi` x2 = `16Gi`)
pub fn scale_quantity(input: &str, factor: u32) -> Option<String> {
    let s = input.trim();
    parse_quantity(s)?;
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if suffix.starts_with(['e', 'E']) && suffix.len() > 1 && suffix[1..].parse::<i32>().is_ok() {
        // exponent form: emit plain number
        let value = s.parse::<f64>().ok()? * f64::from(factor);
        return Some(format_number(value));
    }
    let value: f64 = number.parse().ok()?;
    Some(format!("{}{}", format_number(value * f64::from(factor)), suffix))
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let s = format!("{:.3}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
