//! Fast-marching inpainting (Telea, 2004).
//!
//! Pixels under the mask are filled in order of their distance from the
//! known region. Each filled pixel is a weighted average of the already-known
//! pixels within `radius`, weighted by direction along the distance-field
//! gradient, geometric distance and level-set proximity.

use ndarray::Array2;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Neighbourhood radius used by the compositor.
pub const DEFAULT_RADIUS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Known,
    Band,
    Inside,
}

#[derive(Debug, Clone, Copy)]
struct Front {
    t: f32,
    row: usize,
    col: usize,
}

impl PartialEq for Front {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Front {}

impl PartialOrd for Front {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Front {
    // Reversed so BinaryHeap pops the smallest arrival time first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .t
            .total_cmp(&self.t)
            .then_with(|| other.row.cmp(&self.row))
            .then_with(|| other.col.cmp(&self.col))
    }
}

struct Field {
    flags: Array2<Flag>,
    dist: Array2<f32>,
    rows: usize,
    cols: usize,
}

impl Field {
    fn flag(&self, r: isize, c: isize) -> Flag {
        if r < 0 || c < 0 || r as usize >= self.rows || c as usize >= self.cols {
            Flag::Inside
        } else {
            self.flags[(r as usize, c as usize)]
        }
    }

    fn dist(&self, r: isize, c: isize) -> f32 {
        self.dist[(r as usize, c as usize)]
    }

    /// Solve the eikonal equation at a pixel from two orthogonal neighbours.
    fn solve(&self, r1: isize, c1: isize, r2: isize, c2: isize) -> f32 {
        let known1 = self.flag(r1, c1) != Flag::Inside;
        let known2 = self.flag(r2, c2) != Flag::Inside;
        match (known1, known2) {
            (true, true) => {
                let t1 = self.dist(r1, c1);
                let t2 = self.dist(r2, c2);
                let r = (2.0 - (t1 - t2).powi(2)).max(0.0).sqrt();
                let s = (t1 + t2 - r) / 2.0;
                if s >= t1 && s >= t2 {
                    s
                } else {
                    let s = s + r;
                    if s >= t1 && s >= t2 {
                        s
                    } else {
                        1.0 + t1.min(t2)
                    }
                }
            }
            (true, false) => 1.0 + self.dist(r1, c1),
            (false, true) => 1.0 + self.dist(r2, c2),
            (false, false) => f32::INFINITY,
        }
    }

    fn arrival(&self, r: isize, c: isize) -> f32 {
        self.solve(r - 1, c, r, c - 1)
            .min(self.solve(r + 1, c, r, c - 1))
            .min(self.solve(r - 1, c, r, c + 1))
            .min(self.solve(r + 1, c, r, c + 1))
    }

    /// Central-difference gradient of the distance field, one-sided at the front.
    fn gradient(&self, r: isize, c: isize) -> (f32, f32) {
        let axis = |(ar, ac): (isize, isize), (br, bc): (isize, isize)| {
            let a = self.flag(ar, ac) != Flag::Inside;
            let b = self.flag(br, bc) != Flag::Inside;
            let here = self.dist(r, c);
            match (a, b) {
                (true, true) => (self.dist(br, bc) - self.dist(ar, ac)) * 0.5,
                (true, false) => here - self.dist(ar, ac),
                (false, true) => self.dist(br, bc) - here,
                (false, false) => 0.0,
            }
        };
        (axis((r - 1, c), (r + 1, c)), axis((r, c - 1), (r, c + 1)))
    }
}

/// Fill every pixel where `mask != 0` from its known surroundings.
///
/// Pixels with no known neighbour within `radius` keep their value.
pub fn inpaint_telea(image: &Array2<f32>, mask: &Array2<u8>, radius: usize) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let mut out = image.clone();
    if mask.dim() != image.dim() || !mask.iter().any(|&m| m != 0) {
        return out;
    }

    let flags = mask.mapv(|m| if m != 0 { Flag::Inside } else { Flag::Known });
    let dist = mask.mapv(|m| if m != 0 { f32::INFINITY } else { 0.0 });
    let mut field = Field {
        flags,
        dist,
        rows,
        cols,
    };

    let mut heap = BinaryHeap::new();
    for ((r, c), &flag) in field.flags.indexed_iter() {
        if flag != Flag::Known {
            continue;
        }
        let (ri, ci) = (r as isize, c as isize);
        let touches_hole = [(ri - 1, ci), (ri + 1, ci), (ri, ci - 1), (ri, ci + 1)]
            .into_iter()
            .any(|(nr, nc)| {
                nr >= 0
                    && nc >= 0
                    && (nr as usize) < rows
                    && (nc as usize) < cols
                    && field.flags[(nr as usize, nc as usize)] == Flag::Inside
            });
        if touches_hole {
            heap.push(Front { t: 0.0, row: r, col: c });
        }
    }
    for front in heap.iter() {
        field.flags[(front.row, front.col)] = Flag::Band;
    }

    let radius = radius.max(1) as isize;
    while let Some(Front { row, col, .. }) = heap.pop() {
        field.flags[(row, col)] = Flag::Known;
        let (r, c) = (row as isize, col as isize);
        for (nr, nc) in [(r - 1, c), (r + 1, c), (r, c - 1), (r, c + 1)] {
            if field.flag(nr, nc) != Flag::Inside
                || nr < 0
                || nc < 0
                || nr as usize >= rows
                || nc as usize >= cols
            {
                continue;
            }
            let t = field.arrival(nr, nc);
            let (ur, uc) = (nr as usize, nc as usize);
            field.dist[(ur, uc)] = t;
            if let Some(value) = estimate(&field, &out, nr, nc, radius) {
                out[(ur, uc)] = value;
            }
            field.flags[(ur, uc)] = Flag::Band;
            heap.push(Front { t, row: ur, col: uc });
        }
    }
    out
}

fn estimate(field: &Field, image: &Array2<f32>, r: isize, c: isize, radius: isize) -> Option<f32> {
    let (gr, gc) = field.gradient(r, c);
    let t_here = field.dist(r, c);
    let mut acc = 0.0f32;
    let mut weight_sum = 0.0f32;

    for dr in -radius..=radius {
        for dc in -radius..=radius {
            if (dr == 0 && dc == 0) || dr * dr + dc * dc > radius * radius {
                continue;
            }
            let (nr, nc) = (r + dr, c + dc);
            if field.flag(nr, nc) == Flag::Inside {
                continue;
            }
            // Vector from the neighbour to the pixel being filled.
            let (vr, vc) = (-(dr as f32), -(dc as f32));
            let len2 = vr * vr + vc * vc;
            let len = len2.sqrt();

            let mut dir = (vr * gr + vc * gc).abs() / len;
            if dir <= 0.01 {
                dir = 1e-6;
            }
            let dst = 1.0 / len2;
            let lev = 1.0 / (1.0 + (field.dist(nr, nc) - t_here).abs());
            let w = dir * dst * lev;

            acc += w * image[(nr as usize, nc as usize)];
            weight_sum += w;
        }
    }

    (weight_sum > 0.0).then(|| acc / weight_sum)
}
