#[inline]
pub fn per_sec(count: u64, secs: f64) -> f64 {
    if !secs.is_finite() || secs <= 0.0 {
        return 0.0;
    }
    count as f64 / secs
}

#[inline]
pub fn ratio(hits: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    hits as f64 / total as f64
}

#[inline]
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
