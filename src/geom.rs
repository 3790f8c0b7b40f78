use std::f64::consts::PI;

use crate::utils::DynError;

pub const C: f64 = 299792458.0; // Speed of light in m/s

// Sidereal rotation rate of the Earth in rad/s
pub const EARTH_ROTATION_RAD_S: f64 = 7.292_115_9e-5;

const J2000_MJD: f64 = 51544.5;
const MJD_UNIX_EPOCH: f64 = 40587.0;
const JULIAN_YEAR_DAYS: f64 = 365.25;

enum AngleField {
    /// Plain decimal degrees.
    Degrees(f64),
    /// Hours or degrees from a sexagesimal field.
    Sexagesimal(f64),
}

/// Three sexagesimal components of `text`, split on `separators` or
/// unpacked from a bare `HHMMSS.s` number.
fn sexagesimal_parts(text: &str, separators: &[char]) -> Result<[f64; 3], DynError> {
    let fields = text
        .split(|c: char| separators.contains(&c) || c.is_whitespace())
        .filter(|f| !f.is_empty())
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()?;
    let parts = match fields[..] {
        [packed] => {
            let whole = packed.abs();
            let hi = (whole / 1.0e4).floor();
            let mid = ((whole - hi * 1.0e4) / 100.0).floor();
            [hi, mid, whole - hi * 1.0e4 - mid * 100.0]
        }
        [a, b, c] => [a, b, c],
        _ => return Err(format!("'{text}' is not a sexagesimal value").into()),
    };
    if !(0.0..60.0).contains(&parts[1]) || !(0.0..60.0).contains(&parts[2]) {
        return Err(format!("'{text}': minutes and seconds must lie in [0, 60)").into());
    }
    Ok(parts)
}

fn angle_field(text: &str, separators: &[char]) -> Result<AngleField, DynError> {
    let sexagesimal = |t: &str| {
        sexagesimal_parts(t, separators).map(|[a, b, c]| AngleField::Sexagesimal(a + b / 60.0 + c / 3600.0))
    };
    if text.contains(|c: char| separators.contains(&c) || c.is_whitespace()) {
        return sexagesimal(text);
    }
    let value: f64 = text.parse()?;
    if value.abs() >= 1.0e4 {
        sexagesimal(text)
    } else {
        Ok(AngleField::Degrees(value))
    }
}

/// Right ascension in radians from `12h30m00s`, `12:30:00`, packed
/// `123000` or decimal degrees.
pub fn parse_ra(ra: &str) -> Result<f64, DynError> {
    let text = ra.trim().to_lowercase();
    if text.is_empty() {
        return Err("empty RA".into());
    }
    Ok(match angle_field(&text, &['h', 'm', 's', ':'])? {
        AngleField::Degrees(deg) => deg.to_radians(),
        AngleField::Sexagesimal(hours) => (hours * 15.0).to_radians(),
    })
}

/// Declination in radians from `+45d00m00s`, `-45:00:00`, packed
/// `+450000` or decimal degrees.
pub fn parse_dec(dec: &str) -> Result<f64, DynError> {
    let text = dec.trim().to_lowercase();
    let (sign, body) = match text.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, text.trim_start_matches('+')),
    };
    if body.is_empty() {
        return Err("empty Dec".into());
    }
    let deg = match angle_field(body, &['d', 'm', 's', '\'', '"', ':'])? {
        AngleField::Degrees(d) | AngleField::Sexagesimal(d) => d,
    };
    Ok((sign * deg).to_radians())
}

/// Days since 1970-01-01 of a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let doy = (153 * ((month + 9) % 12) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// `YYYY-MM-DD[Thh:mm[:ss.s]][Z]`, UTC.
fn parse_iso_epoch(text: &str) -> Result<f64, DynError> {
    let text = text.trim_end_matches(|c: char| c == 'Z' || c == 'z');
    let (date, time) = text
        .split_once(|c: char| c == 'T' || c == 't' || c == ' ')
        .unwrap_or((text, ""));
    let ymd = date
        .split('-')
        .map(str::parse::<i64>)
        .collect::<Result<Vec<_>, _>>()?;
    let [year, month, day] = ymd[..] else {
        return Err(format!("epoch date '{date}' is not YYYY-MM-DD").into());
    };
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(format!("epoch date '{date}' is out of range").into());
    }
    let hms = time
        .split(':')
        .filter(|f| !f.is_empty())
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()?;
    if hms.len() > 3 {
        return Err(format!("epoch time '{time}' is not hh:mm:ss").into());
    }
    let seconds: f64 = hms.iter().zip([3600.0, 60.0, 1.0]).map(|(v, s)| v * s).sum();
    Ok(MJD_UNIX_EPOCH + days_from_civil(year, month, day) as f64 + seconds / 86400.0)
}

/// Epoch as MJD from an ISO datetime, a bare MJD, or a (Julian) year such
/// as `2000` or `J2024.5`.
pub fn parse_epoch_to_mjd(epoch: &str) -> Result<f64, DynError> {
    let text = epoch.trim();
    if text.is_empty() {
        return Err("empty epoch".into());
    }
    if text.contains(|c: char| matches!(c, '-' | 'T' | 't' | ':')) {
        return parse_iso_epoch(text);
    }
    let value: f64 = text.trim_start_matches(|c: char| c == 'J' || c == 'j').parse()?;
    match value {
        v if (40_000.0..100_000.0).contains(&v) => Ok(v),
        y if (1800.0..3000.0).contains(&y) => Ok(J2000_MJD + (y - 2000.0) * JULIAN_YEAR_DAYS),
        _ => Err(format!("epoch '{text}' is neither an ISO datetime, an MJD nor a year").into()),
    }
}

/// Greenwich mean sidereal time in radians (IAU 1982, UT1 taken as UTC).
pub fn mjd_to_gmst(mjd: f64) -> f64 {
    let t = (mjd - J2000_MJD) / 36525.0;
    let seconds = 67310.54841 + t * (3_164_400_184.812_866 + t * (0.093104 - 6.2e-6 * t));
    (seconds / 86400.0 * 2.0 * PI).rem_euclid(2.0 * PI)
}

/// Direction cosines (l, m) of (ra, dec) about the tangent point (ra0, dec0),
/// SIN projection.
pub fn radec_to_lm(ra: f64, dec: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let dra = ra - ra0;
    let l = dec.cos() * dra.sin();
    let m = dec.sin() * dec0.cos() - dec.cos() * dec0.sin() * dra.cos();
    (l, m)
}

/// Inverse of [`radec_to_lm`]; `l² + m²` must not exceed 1.
pub fn lm_to_radec(l: f64, m: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let n = (1.0 - l * l - m * m).max(0.0).sqrt();
    let dec = (m * dec0.cos() + n * dec0.sin()).clamp(-1.0, 1.0).asin();
    let ra = ra0 + l.atan2(n * dec0.cos() - m * dec0.sin());
    (ra.rem_euclid(2.0 * PI), dec)
}

/// `n = sqrt(1 - l² - m²)`.
pub fn n_of(l: f64, m: f64) -> f64 {
    (1.0 - l * l - m * m).max(0.0).sqrt()
}

/// Converts local east/north/up offsets (metres) at latitude `lat` into the
/// equatorial frame used for uvw synthesis (X towards hour angle 0, Z to the
/// pole).
pub fn enu_to_xyz(enu: [f64; 3], lat: f64) -> [f64; 3] {
    let [e, n, u] = enu;
    [
        -lat.sin() * n + lat.cos() * u,
        e,
        lat.cos() * n + lat.sin() * u,
    ]
}

/// Baseline (u, v, w) in metres for an equatorial baseline vector at hour
/// angle `ha` and declination `dec`.
pub fn baseline_uvw(b_xyz: [f64; 3], ha: f64, dec: f64) -> [f64; 3] {
    let [bx, by, bz] = b_xyz;
    let (sh, ch) = ha.sin_cos();
    let (sd, cd) = dec.sin_cos();
    let u = sh * bx + ch * by;
    let v = -sd * ch * bx + sd * sh * by + cd * bz;
    let w = cd * ch * bx - cd * sh * by + sd * bz;
    [u, v, w]
}

/// Time derivative of [`baseline_uvw`] in metres per second.
pub fn baseline_uvw_rate(b_xyz: [f64; 3], ha: f64, dec: f64) -> [f64; 3] {
    let [bx, by, _] = b_xyz;
    let (sh, ch) = ha.sin_cos();
    let (sd, cd) = dec.sin_cos();
    let du = ch * bx - sh * by;
    let dv = sd * sh * bx + sd * ch * by;
    let dw = -cd * sh * bx - cd * ch * by;
    [
        du * EARTH_ROTATION_RAD_S,
        dv * EARTH_ROTATION_RAD_S,
        dw * EARTH_ROTATION_RAD_S,
    ]
}

/// Local hour angle of `ra` at `mjd` for an observatory at east longitude `lon`.
pub fn hour_angle(mjd: f64, lon: f64, ra: f64) -> f64 {
    let lst = mjd_to_gmst(mjd) + lon;
    let ha = (lst - ra).rem_euclid(2.0 * PI);
    if ha > PI {
        ha - 2.0 * PI
    } else {
        ha
    }
}

/// Formats radians as `hh:mm:ss.sss`.
pub fn format_ra(ra: f64) -> String {
    let hours = ra.rem_euclid(2.0 * PI).to_degrees() / 15.0;
    let h = hours.floor();
    let m = ((hours - h) * 60.0).floor();
    let s = ((hours - h) * 60.0 - m) * 60.0;
    format!("{:02}:{:02}:{:06.3}", h as u32, m as u32, s)
}

/// Formats radians as `+dd:mm:ss.ss`.
pub fn format_dec(dec: f64) -> String {
    let sign = if dec < 0.0 { '-' } else { '+' };
    let deg = dec.abs().to_degrees();
    let d = deg.floor();
    let m = ((deg - d) * 60.0).floor();
    let s = ((deg - d) * 60.0 - m) * 60.0;
    format!("{}{:02}:{:02}:{:05.2}", sign, d as u32, m as u32, s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn right_ascension_forms_agree() {
        let marked = parse_ra("16h42m58.8s").unwrap();
        assert_abs_diff_eq!(parse_ra("164258.8").unwrap(), marked, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_ra("16:42:58.8").unwrap(), marked, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_ra("180").unwrap(), PI, epsilon = 1e-12);
        assert!(parse_ra("12h75m00s").is_err());
    }

    #[test]
    fn declination_forms_agree() {
        let marked = parse_dec("-39d48m36.0s").unwrap();
        assert_abs_diff_eq!(parse_dec("-394836.0").unwrap(), marked, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_dec("-39:48:36").unwrap(), marked, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_dec("+45").unwrap(), PI / 4.0, epsilon = 1e-12);
        assert!(parse_dec("-").is_err());
    }

    #[test]
    fn epochs_from_years_and_mjd() {
        assert_abs_diff_eq!(parse_epoch_to_mjd("2000").unwrap(), J2000_MJD, epsilon = 1e-9);
        assert_abs_diff_eq!(parse_epoch_to_mjd("J2000").unwrap(), J2000_MJD, epsilon = 1e-9);
        assert_abs_diff_eq!(parse_epoch_to_mjd("60350.25").unwrap(), 60350.25, epsilon = 1e-12);
        assert!(parse_epoch_to_mjd("12").is_err());
    }

    #[test]
    fn lm_radec_round_trip_off_axis() {
        let (ra0, dec0) = (parse_ra("12h30m00s").unwrap(), parse_dec("+45d00m00s").unwrap());
        let (l, m) = (0.031, -0.017);
        let (ra, dec) = lm_to_radec(l, m, ra0, dec0);
        let (l2, m2) = radec_to_lm(ra, dec, ra0, dec0);
        assert_abs_diff_eq!(l, l2, epsilon = 1e-12);
        assert_abs_diff_eq!(m, m2, epsilon = 1e-12);
    }

    #[test]
    fn phase_centre_projects_to_origin() {
        let (l, m) = radec_to_lm(1.2, -0.4, 1.2, -0.4);
        assert_abs_diff_eq!(l, 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(m, 0.0, epsilon = 1e-15);
    }

    #[test]
    fn east_west_baseline_at_transit_is_pure_u() {
        let b = enu_to_xyz([100.0, 0.0, 0.0], 0.6);
        let [u, v, w] = baseline_uvw(b, 0.0, 0.3);
        assert_abs_diff_eq!(u, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(v, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(w, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn uvw_rate_matches_finite_difference() {
        let b = enu_to_xyz([350.0, -120.0, 4.0], 0.9);
        let (ha, dec, dt) = (0.4, 0.7, 1.0);
        let rate = baseline_uvw_rate(b, ha, dec);
        let a = baseline_uvw(b, ha - 0.5 * dt * EARTH_ROTATION_RAD_S, dec);
        let c = baseline_uvw(b, ha + 0.5 * dt * EARTH_ROTATION_RAD_S, dec);
        for k in 0..3 {
            assert_abs_diff_eq!(rate[k], (c[k] - a[k]) / dt, epsilon = 1e-9);
        }
    }

    #[test]
    fn sexagesimal_formatting() {
        assert_eq!(format_ra(parse_ra("01h02m03.5s").unwrap()), "01:02:03.500");
        assert_eq!(format_dec(parse_dec("-10d20m30s").unwrap()), "-10:20:30.00");
    }

    #[test]
    fn iso_epochs_are_utc() {
        assert_abs_diff_eq!(parse_epoch_to_mjd("1970-01-01").unwrap(), MJD_UNIX_EPOCH, epsilon = 1e-12);
        let mjd = parse_epoch_to_mjd("2025-09-29T08:38:00Z").unwrap();
        assert_abs_diff_eq!(mjd, 60947.0 + (8.0 * 60.0 + 38.0) / 1440.0, epsilon = 1e-9);
        assert_abs_diff_eq!(parse_epoch_to_mjd("2000-01-01T12:00").unwrap(), J2000_MJD, epsilon = 1e-9);
        assert!(parse_epoch_to_mjd("2025-13-01").is_err());
    }

    #[test]
    fn sidereal_time_tracks_earth_rotation() {
        let mjd = 60352.66111;
        let d = (mjd_to_gmst(mjd + 1.0 / 86400.0) - mjd_to_gmst(mjd)).rem_euclid(2.0 * PI);
        assert_abs_diff_eq!(d, EARTH_ROTATION_RAD_S, epsilon = 1e-7);
    }
}
