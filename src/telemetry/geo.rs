//! Small geodesy helpers used by waypoint generation and convergence checks.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates in meters (haversine).
pub fn haversine_m(lat1_deg: f64, lon1_deg: f64, lat2_deg: f64, lon2_deg: f64) -> f64 {
    let lat1 = lat1_deg.to_radians();
    let lat2 = lat2_deg.to_radians();
    let dlat = (lat2_deg - lat1_deg).to_radians();
    let dlon = (lon2_deg - lon1_deg).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Offset a coordinate by metric east/north deltas using the flat-earth
/// approximation. Good enough at waypoint scale (hundreds of meters).
pub fn offset_deg(lat_deg: f64, lon_deg: f64, east_m: f64, north_m: f64) -> (f64, f64) {
    let lat_deg_per_m = 1.0 / 111_000.0;
    let cos_lat = lat_deg.to_radians().cos();
    let lon_deg_per_m = if cos_lat != 0.0 {
        1.0 / (111_000.0 * cos_lat)
    } else {
        0.0
    };

    (
        lat_deg + north_m * lat_deg_per_m,
        lon_deg + east_m * lon_deg_per_m,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_zero_distance() {
        assert_eq!(haversine_m(47.3978, 8.5456, 47.3978, 8.5456), 0.0);
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        // One degree of latitude is ~111.2 km everywhere
        let d = haversine_m(47.0, 8.5, 48.0, 8.5);
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }

    #[test]
    fn test_offset_round_trip() {
        let (lat, lon) = offset_deg(47.3978, 8.5456, 100.0, 50.0);
        let d = haversine_m(47.3978, 8.5456, lat, lon);
        let expected = (100.0_f64.powi(2) + 50.0_f64.powi(2)).sqrt();
        // Flat-earth offset vs great-circle distance agree to well under a meter
        // at this scale
        assert!((d - expected).abs() < 1.0, "got {d}, expected {expected}");
    }

    #[test]
    fn test_offset_north_only_changes_latitude() {
        let (lat, lon) = offset_deg(47.3978, 8.5456, 0.0, 111.0);
        assert!(lat > 47.3978);
        assert_eq!(lon, 8.5456);
    }
}
