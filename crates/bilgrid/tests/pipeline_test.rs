//! End-to-end behaviour of the bilateral grid pipeline on the CPU device.

mod common;

use approx::assert_abs_diff_eq;
use bilgrid::{BilateralParams, FilterMode, GridGeometry, GridSnapshot, Session, bilateral_filter};
use bilgrid_compute::{ComputeDevice, CpuDevice, DeviceLimits, GridDims};
use common::image;

fn device() -> CpuDevice {
    CpuDevice::with_limits(DeviceLimits::default())
}

fn splat_snapshot(device: &CpuDevice, data: &[f32], width: usize, height: usize) -> GridSnapshot {
    let input = device.upload(data).unwrap();
    let mut session = Session::create(device, width, height, 4.0, 10.0).unwrap();
    session.splat(&input).unwrap();
    session.snapshot().unwrap()
}

#[test]
fn test_flat_field_4x4() {
    let dev = device();
    let data = vec![0.5; 16];
    let params = BilateralParams::new(2.0, 25.0, 0.0);

    for mode in [FilterMode::Detail, FilterMode::Smooth] {
        let out = bilateral_filter(&dev, &data, 4, 4, &params, mode).unwrap();
        for v in out {
            assert_abs_diff_eq!(v, 0.5, epsilon = 1e-4);
        }
    }
}

#[test]
fn test_flat_field_any_level() {
    let dev = device();
    for level in [0.0, 0.13, 0.5, 0.77, 1.0] {
        let data = vec![level; 37 * 23];
        let out = bilateral_filter(&dev, &data, 37, 23, &BilateralParams::new(5.0, 15.0, 0.0), FilterMode::Smooth)
            .unwrap();
        for v in out {
            assert_abs_diff_eq!(v, level, epsilon = 1e-4);
        }
    }
}

#[test]
fn test_hard_edge_2x2_preserved() {
    let dev = device();
    // left column dark, right column bright
    let data = vec![0.0, 1.0, 0.0, 1.0];
    let params = BilateralParams::new(1.0, 5.0, 0.0);

    let out = bilateral_filter(&dev, &data, 2, 2, &params, FilterMode::Smooth).unwrap();
    for (o, v) in out.iter().zip(&data) {
        assert_abs_diff_eq!(*o, *v, epsilon = 1e-4);
    }

    let out = bilateral_filter(&dev, &data, 2, 2, &params, FilterMode::Detail).unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_step_edge_not_averaged() {
    let dev = device();
    let data = image(16, 16, |x, _| if x < 8 { 0.2 } else { 0.8 });
    let out = bilateral_filter(&dev, &data, 16, 16, &BilateralParams::new(4.0, 10.0, 0.0), FilterMode::Smooth)
        .unwrap();
    for (o, v) in out.iter().zip(&data) {
        assert_abs_diff_eq!(*o, *v, epsilon = 1e-3);
    }
}

#[test]
fn test_small_noise_is_smoothed() {
    let dev = device();
    let data = image(32, 32, |x, y| if (x + y) % 2 == 0 { 0.52 } else { 0.48 });
    let out = bilateral_filter(&dev, &data, 32, 32, &BilateralParams::new(4.0, 20.0, 0.0), FilterMode::Smooth)
        .unwrap();
    for v in out {
        assert_abs_diff_eq!(v, 0.5, epsilon = 0.01);
    }
}

#[test]
fn test_detail_boosts_and_flattens() {
    let dev = device();
    let data = image(32, 32, |x, y| if (x + y) % 2 == 0 { 0.52 } else { 0.48 });
    let params = BilateralParams::new(4.0, 20.0, 0.0);
    let smooth = bilateral_filter(&dev, &data, 32, 32, &params, FilterMode::Smooth).unwrap();
    let boosted = bilateral_filter(&dev, &data, 32, 32, &params.with_detail(1.0), FilterMode::Detail).unwrap();
    let flattened = bilateral_filter(&dev, &data, 32, 32, &params.with_detail(-1.0), FilterMode::Detail).unwrap();

    for i in 0..data.len() {
        let (v, s) = (data[i], smooth[i]);
        assert_abs_diff_eq!(boosted[i], v + (v - s), epsilon = 1e-5);
        // detail = -1 reproduces the smoothed value
        assert_abs_diff_eq!(flattened[i], s, epsilon = 1e-5);
    }
}

#[test]
fn test_slice_is_repeatable() {
    let dev = device();
    let data = image(20, 12, |x, y| ((x * 7 + y * 3) % 11) as f32 / 10.0);
    let input = dev.upload(&data).unwrap();
    let mut session = Session::create(&dev, 20, 12, 3.0, 12.0).unwrap();
    session.splat_and_blur(&input).unwrap();

    let mut first = dev.allocate(data.len()).unwrap();
    let mut second = dev.allocate(data.len()).unwrap();
    session.slice_to_output(&input, &mut first, 0.3).unwrap();
    session.slice_to_output(&input, &mut second, -0.4).unwrap();
    session.slice_to_output(&input, &mut second, 0.3).unwrap();
    assert_eq!(dev.download(&first).unwrap(), dev.download(&second).unwrap());
    session.destroy().unwrap();
}

#[test]
fn test_slice_to_output_overwrites_same_buffer() {
    let dev = device();
    let data = image(16, 16, |x, y| ((x * 5 + y * 11) % 9) as f32 / 8.0);
    let input = dev.upload(&data).unwrap();
    let mut session = Session::create(&dev, 16, 16, 3.0, 12.0).unwrap();
    session.splat_and_blur(&input).unwrap();

    let mut output = dev.allocate(data.len()).unwrap();
    session.slice_to_output(&input, &mut output, 0.5).unwrap();
    let first = dev.download(&output).unwrap();
    session.slice_to_output(&input, &mut output, 0.5).unwrap();
    let second = dev.download(&output).unwrap();

    assert!(first.iter().zip(&second).all(|(a, b)| a.to_bits() == b.to_bits()));
    session.destroy().unwrap();
}

#[test]
fn test_slice_onto_combines_with_base() {
    let dev = device();
    let data = image(16, 16, |x, y| ((x ^ y) % 5) as f32 / 4.0);
    let input = dev.upload(&data).unwrap();
    let mut session = Session::create(&dev, 16, 16, 3.0, 15.0).unwrap();
    session.splat_and_blur(&input).unwrap();

    let mut smooth = dev.allocate(data.len()).unwrap();
    session.smooth(&input, &mut smooth).unwrap();
    let s = dev.download(&smooth).unwrap();

    let base: Vec<f32> = (0..data.len()).map(|i| i as f32 * 0.001).collect();
    let mut output = dev.upload(&base).unwrap();
    session.slice_onto(&input, &mut output, 0.5).unwrap();
    let out = dev.download(&output).unwrap();

    for i in 0..data.len() {
        assert_abs_diff_eq!(out[i], base[i] + 0.5 * (data[i] - s[i]), epsilon = 1e-5);
    }
}

#[test]
fn test_splat_conserves_weight_and_value() {
    let dev = device();
    let data = image(45, 31, |x, y| ((x * 13 + y * 29) % 17) as f32 / 16.0);
    let snap = splat_snapshot(&dev, &data, 45, 31);

    assert_abs_diff_eq!(snap.total_weight(), (45 * 31) as f64, epsilon = 1e-2);
    let value: f64 = snap.values.iter().map(|&v| v as f64).sum();
    let expected: f64 = data.iter().map(|&v| v as f64).sum();
    assert_abs_diff_eq!(value, expected, epsilon = 1e-2);
}

#[test]
fn test_splat_order_invariant_across_threads() {
    let dev = device();
    let data = image(200, 150, |x, y| ((x * 31 + y * 17) % 101) as f32 / 100.0);

    let single = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
    let many = rayon::ThreadPoolBuilder::new().num_threads(8).build().unwrap();
    let a = single.install(|| splat_snapshot(&dev, &data, 200, 150));
    let b = many.install(|| splat_snapshot(&dev, &data, 200, 150));

    assert_eq!(a.dims, b.dims);
    assert!(a.max_abs_diff(&b) < 1e-3, "diff {}", a.max_abs_diff(&b));
}

#[test]
fn test_splat_order_invariant_across_work_groups() {
    let data = image(200, 150, |x, y| ((x * 31 + y * 17) % 101) as f32 / 100.0);

    let wide = device();
    let narrow = CpuDevice::with_limits(DeviceLimits::default()).with_splat_ceiling(256);
    let a = splat_snapshot(&wide, &data, 200, 150);
    let b = splat_snapshot(&narrow, &data, 200, 150);

    assert!(a.max_abs_diff(&b) < 1e-3, "diff {}", a.max_abs_diff(&b));
}

#[test]
fn test_extreme_sigmas_clamp_grid() {
    let dev = device();
    let data = vec![0.3; 9];
    let mut session = Session::create(&dev, 3, 3, 1000.0, 1000.0).unwrap();
    assert_eq!(session.dims(), GridDims::new(5, 5, 5));

    let input = dev.upload(&data).unwrap();
    session.splat_and_blur(&input).unwrap();
    let mut out = dev.allocate(9).unwrap();
    session.smooth(&input, &mut out).unwrap();
    for v in dev.download(&out).unwrap() {
        assert_abs_diff_eq!(v, 0.3, epsilon = 1e-4);
    }
}

#[test]
fn test_out_of_range_values_clamp() {
    let dev = device();
    let data = image(8, 8, |x, _| if x < 4 { -0.5 } else { 1.7 });
    let out = bilateral_filter(&dev, &data, 8, 8, &BilateralParams::new(2.0, 10.0, 0.0), FilterMode::Smooth)
        .unwrap();
    assert!(out.iter().all(|v| v.is_finite()));
}

#[test]
fn test_geometry_bounds() {
    for (w, h) in [(1, 1), (7, 3000), (5000, 5000), (640, 480)] {
        for s in [0.1, 1.0, 16.0, 1e4] {
            for r in [0.5, 5.0, 50.0, 500.0] {
                let d = GridGeometry::grid_dims(w, h, s, r);
                assert!((5..=901).contains(&d.size_x));
                assert!((5..=901).contains(&d.size_y));
                assert!((5..=51).contains(&d.size_z));
                let (eff_s, _) = GridGeometry::effective_sigmas(w, h, &d);
                assert!(eff_s >= w as f32 / (d.size_x - 1) as f32);
                assert!(eff_s >= h as f32 / (d.size_y - 1) as f32);
            }
        }
    }
}
