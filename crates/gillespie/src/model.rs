//! Genetic toggle switch: two mutually repressing proteins.
//!
//! Reactions per system, with propensities
//!
//! | reaction  | rate                              |
//! |-----------|-----------------------------------|
//! | p1 birth  | `alpha1 / (1 + (p2/kappa2)^n1)`   |
//! | p2 birth  | `alpha2 / (1 + (p1/kappa1)^n2)`   |
//! | p1 death  | `p1 / tau1`                       |
//! | p2 death  | `p2 / tau2`                       |

/// Floats per system in the parameter buffer.
pub const PARAM_COUNT: usize = 10;

/// `dominant` value while p1 is the high protein.
pub const P1_HIGH: i32 = 1;
/// `dominant` value while p2 is the high protein.
pub const P2_HIGH: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToggleSwitchParams {
    pub alpha1: f32,
    pub alpha2: f32,
    pub tau1: f32,
    pub tau2: f32,
    pub n1: f32,
    pub n2: f32,
    pub kappa1: f32,
    pub kappa2: f32,
    pub p1_initial: i32,
    pub p2_initial: i32,
}

impl Default for ToggleSwitchParams {
    fn default() -> Self {
        Self::scaled(4.0)
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
impl ToggleSwitchParams {
    /// Symmetric switch with rates and time constants scaled by `beta`.
    #[must_use]
    pub fn scaled(beta: f32) -> Self {
        Self {
            alpha1: beta * 10.0,
            alpha2: beta * 10.0,
            tau1: beta,
            tau2: beta,
            n1: 2.0,
            n2: 2.0,
            kappa1: beta,
            kappa2: beta,
            p1_initial: 160,
            p2_initial: 0,
        }
    }

    /// Packed layout used by the `gillespie_switch` kernel.
    #[must_use]
    pub fn to_vector(&self) -> [f32; PARAM_COUNT] {
        [
            self.alpha1,
            self.alpha2,
            self.tau1,
            self.tau2,
            self.n1,
            self.n2,
            self.kappa1,
            self.kappa2,
            self.p1_initial as f32,
            self.p2_initial as f32,
        ]
    }

    #[must_use]
    pub fn from_vector(v: &[f32; PARAM_COUNT]) -> Self {
        Self {
            alpha1: v[0],
            alpha2: v[1],
            tau1: v[2],
            tau2: v[3],
            n1: v[4],
            n2: v[5],
            kappa1: v[6],
            kappa2: v[7],
            p1_initial: v[8] as i32,
            p2_initial: v[9] as i32,
        }
    }

    /// Rates of p1 birth, p2 birth, p1 death and p2 death.
    #[must_use]
    pub fn propensities(&self, p1: i32, p2: i32) -> [f32; 4] {
        let (x1, x2) = (p1 as f32, p2 as f32);
        [
            self.alpha1 / (1.0 + (x2 / self.kappa2).powf(self.n1)),
            self.alpha2 / (1.0 + (x1 / self.kappa1).powf(self.n2)),
            x1 / self.tau1,
            x2 / self.tau2,
        ]
    }

    /// Copy number a protein must reach, with the other below it, to count
    /// as dominant.
    #[must_use]
    pub fn switch_threshold(&self) -> f32 {
        0.5 * (self.p1_initial.max(self.p2_initial) as f32)
    }

    #[must_use]
    pub fn initial_dominant(&self) -> i32 {
        if self.p1_initial >= self.p2_initial {
            P1_HIGH
        } else {
            P2_HIGH
        }
    }
}

/// Per-system state as stored across the simulation buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemState {
    pub p1: i32,
    pub p2: i32,
    pub dominant: i32,
    /// Time since the last switch.
    pub time: f32,
}

impl SystemState {
    /// Fires one reaction. `u1` draws the waiting time and `u2` picks the
    /// reaction; both lie in (0, 1].
    ///
    /// Returns the residence time when the dominant protein changes, after
    /// which the clock restarts at zero.
    #[allow(clippy::cast_precision_loss)]
    pub fn react(&mut self, params: &ToggleSwitchParams, u1: f32, u2: f32) -> Option<f32> {
        let [r1, r2, r3, r4] = params.propensities(self.p1, self.p2);
        let total = r1 + r2 + r3 + r4;
        if total <= 0.0 {
            return None;
        }

        let mut t = self.time - u1.ln() / total;
        let pick = u2 * total;
        if pick < r1 {
            self.p1 += 1;
        } else if pick < r1 + r2 {
            self.p2 += 1;
        } else if pick < r1 + r2 + r3 {
            self.p1 -= 1;
        } else {
            self.p2 -= 1;
        }

        let threshold = params.switch_threshold();
        let (x1, x2) = (self.p1 as f32, self.p2 as f32);
        let mut state = self.dominant;
        if x1 >= threshold && x2 < threshold {
            state = P1_HIGH;
        } else if x2 >= threshold && x1 < threshold {
            state = P2_HIGH;
        }

        let mut switched = None;
        if state != self.dominant {
            self.dominant = state;
            switched = Some(t);
            t = 0.0;
        }
        self.time = t;
        switched
    }
}
