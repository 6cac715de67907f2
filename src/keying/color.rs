/// A colour in hue/saturation/lightness form.
///
/// `h` is in degrees `[0, 360)`, `s` and `l` are on the same 0-255 scale as
/// the input channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hsl {
    pub h: f32,
    pub s: f32,
    pub l: f32,
}

/// Convert an 8-bit RGB triple to HSL.
///
/// Achromatic colours (all channels equal) get hue and saturation 0.
#[inline]
pub fn to_hsl(r: u8, g: u8, b: u8) -> Hsl {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);

    let max_f = max as f32 / 255.0;
    let min_f = min as f32 / 255.0;
    let l = (max_f + min_f) / 2.0;

    if max == min {
        return Hsl {
            h: 0.0,
            s: 0.0,
            l: l * 255.0,
        };
    }

    let d = max_f - min_f;
    let s = if l > 0.5 {
        d / (2.0 - max_f - min_f)
    } else {
        d / (max_f + min_f)
    };

    let (rf, gf, bf) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let sector = if max == r {
        (gf - bf) / d + if g < b { 6.0 } else { 0.0 }
    } else if max == g {
        (bf - rf) / d + 2.0
    } else {
        (rf - gf) / d + 4.0
    };

    // Rounding at the top of the red sector can land exactly on 360.
    let mut h = sector * 60.0;
    if h >= 360.0 {
        h -= 360.0;
    }

    Hsl {
        h,
        s: (s * 255.0).clamp(0.0, 255.0),
        l: (l * 255.0).clamp(0.0, 255.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.01
    }

    #[test]
    fn primaries() {
        let red = to_hsl(255, 0, 0);
        assert!(close(red.h, 0.0) && close(red.s, 255.0) && close(red.l, 127.5));

        let green = to_hsl(0, 255, 0);
        assert!(close(green.h, 120.0) && close(green.s, 255.0));

        let blue = to_hsl(0, 0, 255);
        assert!(close(blue.h, 240.0));
    }

    #[test]
    fn grays_have_no_hue_or_saturation() {
        for v in [0u8, 1, 64, 128, 200, 255] {
            let hsl = to_hsl(v, v, v);
            assert_eq!(hsl.h, 0.0);
            assert_eq!(hsl.s, 0.0);
            assert!(close(hsl.l, v as f32));
        }
    }

    #[test]
    fn output_ranges_hold_over_a_channel_grid() {
        for r in (0..=255u16).step_by(15) {
            for g in (0..=255u16).step_by(15) {
                for b in (0..=255u16).step_by(15) {
                    let hsl = to_hsl(r as u8, g as u8, b as u8);
                    assert!((0.0..360.0).contains(&hsl.h), "h={} for {r},{g},{b}", hsl.h);
                    assert!((0.0..=255.0).contains(&hsl.s));
                    assert!((0.0..=255.0).contains(&hsl.l));
                }
            }
        }
    }

    #[test]
    fn magenta_side_of_red_wraps_below_360() {
        let hsl = to_hsl(255, 0, 1);
        assert!(hsl.h > 359.0 && hsl.h < 360.0);
    }
}
