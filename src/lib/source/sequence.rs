/// Extends a 16-bit wrapping sequence number against the last unwrapped
/// value. The result is always strictly greater than `last`: an equal low
/// half means a full wrap happened.
pub fn unwrap_sequence(current: u16, last: i64) -> i64 {
    let last_wrapped = (last & 0xffff) as u16;
    let base = last & !0xffff;

    if current > last_wrapped {
        base | current as i64
    } else {
        0x10000 + (base | current as i64)
    }
}

/// Largest gap still treated as dropped frames for a source running at
/// `fps`; anything beyond is a discontinuity.
pub fn max_plausible_gap(fps: f64) -> i64 {
    (2.0 * fps).ceil() as i64
}
