//! Quarter-turn rotation and axis flips on 2-D arrays.

use crate::settings::Flip;
use ndarray::{s, Array2, ArrayView2};

/// Rotate by `quarter_turns` × 90° counter-clockwise.
pub fn rotate_ccw<T: Clone>(image: ArrayView2<'_, T>, quarter_turns: u8) -> Array2<T> {
    let view = match quarter_turns % 4 {
        0 => image,
        1 => image.reversed_axes().slice_move(s![..;-1, ..]),
        2 => image.slice_move(s![..;-1, ..;-1]),
        _ => image.reversed_axes().slice_move(s![.., ..;-1]),
    };
    view.as_standard_layout().into_owned()
}

pub fn flip<T: Clone>(image: ArrayView2<'_, T>, flip: Flip) -> Array2<T> {
    let view = match flip {
        Flip::None => image,
        Flip::Vertical => image.slice_move(s![..;-1, ..]),
        Flip::Horizontal => image.slice_move(s![.., ..;-1]),
        Flip::Both => image.slice_move(s![..;-1, ..;-1]),
    };
    view.as_standard_layout().into_owned()
}

/// Rotation followed by flip.
pub fn orient<T: Clone>(image: ArrayView2<'_, T>, quarter_turns: u8, axis: Flip) -> Array2<T> {
    if axis == Flip::None {
        return rotate_ccw(image, quarter_turns);
    }
    let rotated = rotate_ccw(image, quarter_turns);
    flip(rotated.view(), axis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_rotate_ccw_quarter() {
        let a = array![[1, 2, 3], [4, 5, 6]];
        assert_eq!(rotate_ccw(a.view(), 1), array![[3, 6], [2, 5], [1, 4]]);
        assert_eq!(rotate_ccw(a.view(), 3), array![[4, 1], [5, 2], [6, 3]]);
        assert_eq!(rotate_ccw(a.view(), 2), array![[6, 5, 4], [3, 2, 1]]);
    }

    #[test]
    fn test_rotation_group() {
        let a = array![[1, 2, 3], [4, 5, 6]];
        let mut r = a.clone();
        for _ in 0..4 {
            r = rotate_ccw(r.view(), 1);
        }
        assert_eq!(r, a);
        let half = rotate_ccw(a.view(), 2);
        assert_eq!(rotate_ccw(half.view(), 2), a);
        assert_eq!(rotate_ccw(a.view(), 6), half);
    }

    #[test]
    fn test_flips() {
        let a = array![[1, 2], [3, 4]];
        assert_eq!(flip(a.view(), Flip::Vertical), array![[3, 4], [1, 2]]);
        assert_eq!(flip(a.view(), Flip::Horizontal), array![[2, 1], [4, 3]]);
        let both = flip(a.view(), Flip::Both);
        let v = flip(a.view(), Flip::Vertical);
        assert_eq!(both, flip(v.view(), Flip::Horizontal));
    }

    #[test]
    fn test_orient_is_standard_layout() {
        let a = array![[1u8, 2, 3], [4, 5, 6]];
        let out = orient(a.view(), 1, Flip::Horizontal);
        assert!(out.is_standard_layout());
        assert_eq!(out, array![[6, 3], [5, 2], [4, 1]]);
    }
}
