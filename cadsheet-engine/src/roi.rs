//! 以图框右下角为原点的 ROI 换算。

use cadsheet_config::RoiOffset;
use cadsheet_core::geometry::{Bounds2D, Point2};

/// 把名义偏移量换算为世界坐标矩形。
///
/// `x ∈ [ax - dx_left·sx, ax - dx_right·sx]`，`y ∈ [ay + dy_bottom·sy, ay + dy_top·sy]`，
/// 随后按矩形自身宽高的 `margin_percent` 外扩。纯函数，相同输入得到相同结果。
pub fn resolve_roi(
    anchor: Point2,
    sx: f64,
    sy: f64,
    offset: &RoiOffset,
    margin_percent: f64,
) -> Bounds2D {
    let rect = Bounds2D::from_corners(
        Point2::new(anchor.x() - offset.dx_left * sx, anchor.y() + offset.dy_bottom * sy),
        Point2::new(anchor.x() - offset.dx_right * sx, anchor.y() + offset.dy_top * sy),
    );
    if margin_percent <= 0.0 {
        return rect;
    }
    rect.expanded(rect.width() * margin_percent, rect.height() * margin_percent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(values: [f64; 4]) -> RoiOffset {
        RoiOffset::try_from(values.to_vec()).expect("four values")
    }

    #[test]
    fn anchored_at_bottom_right_and_scaled() {
        let roi = resolve_roi(Point2::new(1000.0, 50.0), 2.0, 2.0, &offset([0.0, 90.0, 20.0, 30.0]), 0.0);
        assert_eq!(roi.min(), Point2::new(820.0, 90.0));
        assert_eq!(roi.max(), Point2::new(1000.0, 110.0));
    }

    #[test]
    fn margin_expands_by_own_size() {
        let roi = resolve_roi(Point2::new(100.0, 0.0), 1.0, 1.0, &offset([0.0, 100.0, 0.0, 10.0]), 0.1);
        assert!((roi.min().x() - -10.0).abs() < 1e-9);
        assert!((roi.max().x() - 110.0).abs() < 1e-9);
        assert!((roi.min().y() - -1.0).abs() < 1e-9);
        assert!((roi.max().y() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn identical_inputs_resolve_identically() {
        let o = offset([30.0, 60.0, 10.0, 20.0]);
        let a = resolve_roi(Point2::new(841.5, 12.25), 1.01, 0.99, &o, 0.02);
        let b = resolve_roi(Point2::new(841.5, 12.25), 1.01, 0.99, &o, 0.02);
        assert_eq!(a, b);
    }
}
