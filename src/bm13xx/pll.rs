// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! PLL divider search for the BM13xx clock tree. The chips derive the
//! hash clock from a 25 MHz crystal through a feedback divider, a
//! reference divider and two post dividers; the register payload built
//! here goes to PLL0 (register 0x08).

use super::PLL0_PARAMETER_REG;

/// Crystal frequency in MHz, the base of every divider ratio
pub const XTAL_MHZ: f64 = 25.0;

/// Frequency the chips wake up at after a reset; ramps start here
pub const POST_RESET_MHZ: f64 = 56.25;

/// Step size of the frequency ramp
pub const RAMP_STEP_MHZ: f64 = 6.25;

/// How close the achieved frequency must come to the target
const MAX_DIFF_MHZ: f64 = 0.001;

/// VCO frequencies at or above this need the high-range flag set in
/// the parameter register
const VCO_HIGH_RANGE_MHZ: u32 = 2400;

/// One divider assignment together with the frequency it achieves
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllSolution {
    pub refdiv: u8,
    pub fbdiv: u16,
    pub postdiv1: u8,
    pub postdiv2: u8,
    pub frequency: f64,
}

impl PllSolution {
    /// PLL0 parameter register payload for this assignment
    pub fn payload(&self) -> [u8; 6] {
        let vco_flag = if u32::from(self.fbdiv) * 25 / u32::from(self.refdiv)
            >= VCO_HIGH_RANGE_MHZ
        {
            0x50
        } else {
            0x40
        };
        [
            0x00,
            PLL0_PARAMETER_REG,
            vco_flag,
            self.fbdiv as u8,
            self.refdiv,
            ((self.postdiv1 - 1) & 0xf) << 4 | ((self.postdiv2 - 1) & 0xf),
        ]
    }
}

/// Exhaustive divider search. Candidates must put the feedback divider
/// inside the chip's valid range and hit the target within tolerance;
/// among those the search keeps the smallest post divider product
/// (lowest VCO load), tie-broken by the smaller second post divider.
pub fn solve(target_mhz: f64, fbdiv_range: (u16, u16)) -> Option<PllSolution> {
    let mut best: Option<PllSolution> = None;
    let mut postdiv_min = 255u8;
    let mut postdiv2_min = 255u8;

    for refdiv in (1..=2u8).rev() {
        for postdiv1 in (1..=7u8).rev() {
            for postdiv2 in (1..=7u8).rev() {
                let divider = u32::from(refdiv) * u32::from(postdiv1) * u32::from(postdiv2);
                let fbdiv = (target_mhz / XTAL_MHZ * divider as f64).round() as u16;
                let achieved = XTAL_MHZ * f64::from(fbdiv) / divider as f64;

                if fbdiv >= fbdiv_range.0
                    && fbdiv <= fbdiv_range.1
                    && (target_mhz - achieved).abs() < MAX_DIFF_MHZ
                    && postdiv1 >= postdiv2
                    && postdiv1 * postdiv2 < postdiv_min
                    && postdiv2 <= postdiv2_min
                {
                    postdiv2_min = postdiv2;
                    postdiv_min = postdiv1 * postdiv2;
                    best = Some(PllSolution {
                        refdiv,
                        fbdiv,
                        postdiv1,
                        postdiv2,
                        frequency: achieved,
                    });
                }
            }
        }
    }
    best
}

/// Integer variant of the search working in kHz, for chips whose
/// divider register only accepts whole-MHz feedback values. Valid
/// feedback range is fixed at 160-235.
pub fn solve_khz(target_khz: u32) -> Option<PllSolution> {
    let mut best: Option<PllSolution> = None;
    let mut k_pll_div_lowest = 0u32;

    for refdiv in (1..=2u8).rev() {
        if best.is_some() && refdiv == 1 {
            // a refdiv 2 solution always beats any refdiv 1 one
            break;
        }
        for postdiv1 in (1..=7u8).rev() {
            for postdiv2 in 1..=postdiv1 {
                let k_fd = target_khz * u32::from(refdiv) * u32::from(postdiv1)
                    * u32::from(postdiv2)
                    / 25;
                if k_fd % 1000 != 0 {
                    continue;
                }
                if k_fd < 160_000 {
                    continue;
                }
                if k_fd > 235_000 {
                    break;
                }
                let k_pll_div = k_fd / u32::from(refdiv);
                if k_pll_div_lowest != 0 && k_pll_div >= k_pll_div_lowest {
                    continue;
                }
                k_pll_div_lowest = k_pll_div;
                let fbdiv = (k_fd / 1000) as u16;
                best = Some(PllSolution {
                    refdiv,
                    fbdiv,
                    postdiv1,
                    postdiv2,
                    frequency: f64::from(25_000 * u32::from(fbdiv))
                        / f64::from(
                            u32::from(refdiv) * u32::from(postdiv1) * u32::from(postdiv2),
                        )
                        / 1000.0,
                });
            }
        }
    }
    best
}

impl PllSolution {
    /// Payload variant for the kHz search: the VCO flag trips on the
    /// undivided kHz PLL frequency instead of the MHz VCO estimate
    pub fn payload_khz(&self) -> [u8; 6] {
        let k_pll_div = 1000 * u32::from(self.fbdiv) / u32::from(self.refdiv);
        let vco_flag = if k_pll_div >= 96_000 { 0x50 } else { 0x40 };
        [
            0x00,
            PLL0_PARAMETER_REG,
            vco_flag,
            self.fbdiv as u8,
            self.refdiv,
            ((self.postdiv1 - 1) & 0xf) << 4 | ((self.postdiv2 - 1) & 0xf),
        ]
    }
}

/// Divider calculation used by the BM1397, which predates the
/// refdiv/postdiv register layout. The target is folded into the
/// 2500-6500 band with fixed small multipliers, rounded up to the next
/// 25 MHz multiple and expressed as `fa * 25 / (fb * fc1 * fc2)`.
/// An out-of-band result falls back to the documented 200 MHz default.
pub fn solve_bm1397(target_mhz: f64) -> ([u8; 6], f64) {
    let default = ([0x00, PLL0_PARAMETER_REG, 0x40, 0xa0, 0x02, 0x25], 200.0);

    let f1 = target_mhz.max(50.0).min(650.0);
    let mut fb = 2u32;
    let mut fc1 = 1u32;
    let fc2 = 5u32;
    if f1 >= 500.0 {
        fb = 1;
    } else if f1 <= 150.0 {
        fc1 = 3;
    } else if f1 <= 250.0 {
        fc1 = 2;
    }

    let basef = XTAL_MHZ * (f1 * (fb * fc1 * fc2) as f64 / XTAL_MHZ).ceil();
    let fa = (basef / XTAL_MHZ) as u32;
    if fa < 0x10 || fa > 0x104 {
        return default;
    }

    let payload = [
        0x00,
        PLL0_PARAMETER_REG,
        0x40 + (fa >> 8) as u8,
        (fa & 0xff) as u8,
        fb as u8,
        (((fc1 & 0x7) << 4) + (fc2 & 0x7)) as u8,
    ];
    (payload, basef / (fb * fc1 * fc2) as f64)
}

/// Step plan of a frequency ramp: every intermediate set point from
/// `from` (exclusive) to `to` (inclusive). An unaligned starting point
/// is first snapped onto the step grid, towards the target.
pub fn ramp_steps(from: f64, to: f64) -> Vec<f64> {
    let mut steps = Vec::new();
    if (to - from).abs() < f64::EPSILON {
        return steps;
    }
    let up = to > from;

    let mut current = from;
    if (current / RAMP_STEP_MHZ).fract() != 0.0 {
        current = if up {
            (current / RAMP_STEP_MHZ).ceil() * RAMP_STEP_MHZ
        } else {
            (current / RAMP_STEP_MHZ).floor() * RAMP_STEP_MHZ
        };
        steps.push(current);
    }

    loop {
        let remaining = (to - current).abs();
        if remaining < f64::EPSILON {
            break;
        }
        let step = RAMP_STEP_MHZ.min(remaining);
        current = if up { current + step } else { current - step };
        steps.push(current);
    }

    if steps.last() != Some(&to) {
        steps.push(to);
    }
    steps
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn float_search_known_points() {
        // 490 MHz: refdiv 2, fbdiv 196, postdiv 5/1, high VCO range
        let s = solve(490.0, (144, 235)).unwrap();
        assert_eq!((s.refdiv, s.fbdiv, s.postdiv1, s.postdiv2), (2, 196, 5, 1));
        assert_eq!(s.payload(), [0x00, 0x08, 0x50, 0xc4, 0x02, 0x40]);

        // the post-reset frequency itself has a solution
        let s = solve(POST_RESET_MHZ, (144, 235)).unwrap();
        assert_eq!((s.refdiv, s.fbdiv, s.postdiv1, s.postdiv2), (2, 162, 6, 6));
        assert_eq!(s.payload(), [0x00, 0x08, 0x40, 0xa2, 0x02, 0x55]);

        let s = solve(525.0, (144, 235)).unwrap();
        assert_eq!(s.payload(), [0x00, 0x08, 0x40, 0xa8, 0x02, 0x30]);
    }

    #[test]
    fn float_search_range_dependent() {
        // 600 MHz only solves in the wider feedback range
        let s = solve(600.0, (160, 239)).unwrap();
        assert_eq!(s.payload(), [0x00, 0x08, 0x50, 0xc0, 0x02, 0x30]);
        // 572 MHz has no divider assignment at all
        assert!(solve(572.0, (144, 235)).is_none());
    }

    #[test]
    fn khz_search_known_points() {
        // 200 MHz reproduces the chip's documented default setting
        let s = solve_khz(200_000).unwrap();
        assert_eq!(s.payload_khz(), [0x00, 0x08, 0x40, 0xa0, 0x02, 0x41]);

        // 485 MHz lands in the high VCO range
        let s = solve_khz(485_000).unwrap();
        assert_eq!((s.refdiv, s.fbdiv, s.postdiv1, s.postdiv2), (2, 194, 5, 1));
        assert_eq!(s.payload_khz(), [0x00, 0x08, 0x50, 0xc2, 0x02, 0x40]);

        let s = solve_khz(56_250).unwrap();
        assert_eq!(s.payload_khz(), [0x00, 0x08, 0x40, 0xa2, 0x02, 0x55]);
    }

    #[test]
    fn bm1397_divider_known_points() {
        // 200 MHz reproduces the documented default setting
        assert_eq!(
            solve_bm1397(200.0),
            ([0x00, 0x08, 0x40, 0xa0, 0x02, 0x25], 200.0)
        );
        // mid band keeps the doubler off
        assert_eq!(
            solve_bm1397(425.0),
            ([0x00, 0x08, 0x40, 0xaa, 0x02, 0x15], 425.0)
        );
        // low band triples up
        assert_eq!(
            solve_bm1397(100.0),
            ([0x00, 0x08, 0x40, 0x78, 0x02, 0x35], 100.0)
        );
        // above 500 MHz the pre-divider halves
        assert_eq!(
            solve_bm1397(550.0),
            ([0x00, 0x08, 0x40, 0x6e, 0x01, 0x15], 550.0)
        );
        // clamped at the documented ceiling
        assert_eq!(
            solve_bm1397(700.0),
            ([0x00, 0x08, 0x40, 0x82, 0x01, 0x15], 650.0)
        );
    }

    #[test]
    fn ramp_walks_in_steps() {
        let steps = ramp_steps(56.25, 75.0);
        assert_eq!(steps, vec![62.5, 68.75, 75.0]);

        // unaligned start snaps onto the grid first
        let steps = ramp_steps(60.0, 75.0);
        assert_eq!(steps, vec![62.5, 68.75, 75.0]);

        // downward ramps work the same way
        let steps = ramp_steps(75.0, 62.5);
        assert_eq!(steps, vec![68.75, 62.5]);

        // unaligned target gets one exact final step
        let steps = ramp_steps(56.25, 60.0);
        assert_eq!(steps, vec![60.0]);

        assert!(ramp_steps(75.0, 75.0).is_empty());
    }
}
