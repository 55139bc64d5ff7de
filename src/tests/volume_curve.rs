use crate::client::MAX_RELATIVE_VOLUME;
use crate::volume_curve::{TransferFunction, VolumeCurve};

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-4
}

#[test]
fn app_curve_bounds() {
    let curve = VolumeCurve::app_relative_volume();
    assert_eq!(curve.min_raw(), 0);
    assert_eq!(curve.max_raw(), 100);
    assert!(approx(curve.min_db(), -96.0));
    assert!(approx(curve.max_db(), 0.0));
    assert_eq!(curve.transfer_function(), TransferFunction::Pow2Over1);
    assert!(curve.is_continuous());
}

#[test]
fn midpoint_is_unity_gain() {
    let curve = VolumeCurve::app_relative_volume();
    assert!(approx(curve.raw_to_scalar(50) * MAX_RELATIVE_VOLUME, 1.0));
    assert!(approx(curve.raw_to_scalar(0) * MAX_RELATIVE_VOLUME, 0.0));
    assert!(approx(curve.raw_to_scalar(100) * MAX_RELATIVE_VOLUME, 4.0));
}

#[test]
fn raw_scalar_round_trip() {
    let curve = VolumeCurve::app_relative_volume();
    for raw in 0..=100 {
        let relative = curve.raw_to_scalar(raw) * MAX_RELATIVE_VOLUME;
        assert_eq!(curve.scalar_to_raw(relative / MAX_RELATIVE_VOLUME), raw);
    }
}

#[test]
fn raw_db_round_trip() {
    let curve = VolumeCurve::app_relative_volume();
    for raw in 0..=100 {
        assert_eq!(curve.db_to_raw(curve.raw_to_db(raw)), raw);
    }
    assert!(approx(curve.raw_to_db(50), -48.0));
}

#[test]
fn out_of_range_inputs_are_clamped() {
    let curve = VolumeCurve::app_relative_volume();
    assert_eq!(curve.raw_to_scalar(-20), 0.0);
    assert_eq!(curve.raw_to_scalar(250), 1.0);
    assert_eq!(curve.scalar_to_raw(-1.0), 0);
    assert_eq!(curve.scalar_to_raw(3.0), 100);
    assert!(approx(curve.raw_to_db(1000), 0.0));
    assert_eq!(curve.db_to_raw(-200.0), 0);
}

#[test]
fn scalar_is_monotonic() {
    let curve = VolumeCurve::app_relative_volume();
    let scalars: Vec<f32> = (0..=100).map(|raw| curve.raw_to_scalar(raw)).collect();
    assert!(scalars.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn narrow_curves_are_linear() {
    let mut curve = VolumeCurve::new();
    assert!(curve.add_range(0, 10, -20.0, 0.0));
    assert!(approx(curve.raw_to_scalar(5), 0.5));
}

#[test]
fn transfer_function_shapes_the_scalar() {
    let mut curve = VolumeCurve::app_relative_volume();
    curve.set_transfer_function(TransferFunction::Linear);
    assert!(approx(curve.raw_to_scalar(50), 0.5));
    curve.set_transfer_function(TransferFunction::Pow3Over1);
    assert!(approx(curve.raw_to_scalar(50), 0.125));
    curve.set_transfer_function(TransferFunction::Pow1Over2);
    assert!(approx(curve.raw_to_scalar(25), 0.5));
    assert_eq!(curve.scalar_to_raw(0.5), 25);
}

#[test]
fn overlapping_and_empty_ranges_are_rejected() {
    let mut curve = VolumeCurve::new();
    assert!(curve.add_range(0, 50, -96.0, -30.0));
    assert!(!curve.add_range(40, 60, -40.0, -20.0));
    assert!(!curve.add_range(70, 70, -10.0, 0.0));
    assert!(curve.add_range(50, 100, -30.0, 0.0));
    assert!(curve.is_continuous());
    assert_eq!(curve.max_raw(), 100);
    assert!(approx(curve.raw_to_db(75), -15.0));

    curve.reset_ranges();
    assert_eq!(curve.max_raw(), 0);
    assert_eq!(curve.raw_to_scalar(10), 0.0);
}
