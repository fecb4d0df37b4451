//! Quasi-Newton acceleration variants: IQN-ILS, IQN-IMVJ (with restart
//! modes), and Broyden's second method.
//!
//! All three share the same secant bookkeeping: a history of input/output
//! differences (`V`/`W` columns) used either to solve a small least-squares
//! system (IQN-ILS, and IQN-IMVJ when not holding an explicit Jacobian) or
//! to maintain an explicit approximate inverse Jacobian via rank-1 updates
//! (IQN-IMVJ with `always_build_jacobian = false`, and Broyden).

use crate::acceleration::{AccelerationError, Accelerator, StackedLayout};
use crate::config::ImvjRestartMode;
use crate::preconditioner::Preconditioner;
use crate::qr::{FilterKind, QrDecomposition, TruncatedSvd};
use crate::{Matrix, Vector};

fn check_lengths(x: &Vector, r: &Vector) -> Result<(), AccelerationError> {
    if x.len() != r.len() {
        return Err(AccelerationError::LengthMismatch { values: x.len(), residual: r.len() });
    }
    Ok(())
}

/// Shared `V`/`W` secant-pair history plus the QR factorization of `V`.
struct SecantHistory {
    qr: QrDecomposition,
    v_columns: Vec<Vector>,
    w_columns: Vec<Vector>,
    max_columns: usize,
    deleted_columns: usize,
}

impl SecantHistory {
    fn new(n: usize, max_columns: usize) -> Self {
        Self { qr: QrDecomposition::empty(n), v_columns: Vec::new(), w_columns: Vec::new(), max_columns, deleted_columns: 0 }
    }

    /// Insert a new `(dv, dw)` secant pair, applying `filter` and enforcing
    /// `max_columns` by dropping the oldest column first.
    fn push(&mut self, dv: Vector, dw: Vector, filter: FilterKind) -> Result<(), AccelerationError> {
        self.deleted_columns = 0;
        let accepted = self.qr.insert_column(&dv, filter).map_err(|_| {
            AccelerationError::LengthMismatch { values: dv.len(), residual: self.qr.q().nrows() }
        })?;
        if !accepted {
            self.deleted_columns += 1;
            return Ok(());
        }
        self.v_columns.push(dv);
        self.w_columns.push(dw);
        if self.v_columns.len() > self.max_columns {
            let _ = self.qr.delete_column(0);
            self.v_columns.remove(0);
            self.w_columns.remove(0);
            self.deleted_columns += 1;
        }
        if let Ok(dropped) = self.qr.filter_columns(filter) {
            for idx in dropped.iter().rev() {
                self.v_columns.remove(*idx);
                self.w_columns.remove(*idx);
            }
            self.deleted_columns += dropped.len();
        }
        Ok(())
    }

    fn clear(&mut self, n: usize) {
        self.qr = QrDecomposition::empty(n);
        self.v_columns.clear();
        self.w_columns.clear();
    }

    /// Keep only the most recent `keep` columns (RS-SLIDE, or the
    /// reused-timestep cap for RS-LS).
    fn truncate_to(&mut self, keep: usize, n: usize) {
        if self.v_columns.len() <= keep {
            return;
        }
        let drop = self.v_columns.len() - keep;
        let v: Vec<_> = self.v_columns.split_off(drop);
        let w: Vec<_> = self.w_columns.split_off(drop);
        self.v_columns = v;
        self.w_columns = w;
        self.qr = QrDecomposition::block_mgs(&self.v_columns, n, FilterKind::NoFilter);
    }

    fn rank(&self) -> usize {
        self.qr.rank()
    }
}

/// Combine `(w_alpha - v_alpha)` from an `alpha` solved against the current
/// history.
fn history_combination(history: &SecantHistory, alpha: &Vector, n: usize) -> (Vector, Vector) {
    let mut w_alpha = Vector::zeros(n);
    let mut v_alpha = Vector::zeros(n);
    for (i, a) in alpha.iter().enumerate() {
        w_alpha += &history.w_columns[i] * *a;
        v_alpha += &history.v_columns[i] * *a;
    }
    (w_alpha, v_alpha)
}

/// Interface quasi-Newton least-squares (IQN-ILS): solves
/// `alpha = argmin ||V alpha + r_k||` in preconditioned space each
/// iteration and proposes `x_{k+1} = x_k - r_k + (W - V) alpha`. Falls back
/// to constant relaxation on the first iteration of a run (no history yet)
/// or if the least-squares system is singular.
pub struct IqnIls {
    initial_relaxation: f64,
    filter: FilterKind,
    history: SecantHistory,
    previous_x_tilde: Option<Vector>,
    previous_r: Option<Vector>,
    force_initial_relaxation: bool,
    timesteps_reused: Option<usize>,
    n: usize,
}

impl IqnIls {
    /// Build with the given first-iteration relaxation factor, column
    /// filter, and maximum retained history width. History is carried
    /// across time windows; call [`Self::with_force_initial_relaxation`] to
    /// discard it at every window boundary instead.
    pub fn new(initial_relaxation: f64, filter: FilterKind, max_columns_used: usize) -> Self {
        Self {
            initial_relaxation,
            filter,
            history: SecantHistory::new(0, max_columns_used.max(1)),
            previous_x_tilde: None,
            previous_r: None,
            force_initial_relaxation: false,
            timesteps_reused: None,
            n: 0,
        }
    }

    /// `forceInitialRelaxation`: if `true`, the `V`/`W` history is dropped at
    /// every time window's end, so the next window's first iteration falls
    /// back to `initial_relaxation` instead of reusing history across
    /// windows.
    pub fn with_force_initial_relaxation(mut self, force: bool) -> Self {
        self.force_initial_relaxation = force;
        self
    }

    /// `timestepsReused`: cap the history to this many columns at every
    /// time window's end, independent of the per-iteration `max_columns`
    /// cap already enforced by [`SecantHistory::push`].
    pub fn with_timesteps_reused(mut self, columns: Option<usize>) -> Self {
        self.timesteps_reused = columns;
        self
    }
}

impl Accelerator for IqnIls {
    fn initialize(&mut self, layout: &StackedLayout) {
        self.n = layout.total();
        self.history = SecantHistory::new(self.n, self.history.max_columns);
        self.previous_x_tilde = None;
        self.previous_r = None;
    }

    fn perform_acceleration(
        &mut self,
        x: &Vector,
        r: &Vector,
        preconditioner: &mut Preconditioner,
    ) -> Result<Vector, AccelerationError> {
        check_lengths(x, r)?;
        let x_tilde = x + r;

        let next = if let (Some(prev_xt), Some(prev_r)) =
            (self.previous_x_tilde.clone(), self.previous_r.clone())
        {
            let dv = preconditioner.apply_vector(&(r - &prev_r))?;
            let dw = &x_tilde - &prev_xt;
            self.history.push(dv, dw, self.filter)?;

            if self.history.rank() == 0 {
                x + r * self.initial_relaxation
            } else {
                let scaled_r = preconditioner.apply_vector(r)?;
                match self.history.qr.solve_least_squares(&(-&scaled_r)) {
                    Ok(alpha) => {
                        let (w_alpha, v_alpha) = history_combination(&self.history, &alpha, self.n);
                        x + (w_alpha - v_alpha) - r
                    }
                    Err(_) => {
                        tracing::warn!(
                            "IQN-ILS least-squares system is singular, falling back to constant relaxation"
                        );
                        x + r * self.initial_relaxation
                    }
                }
            }
        } else {
            x + r * self.initial_relaxation
        };

        self.previous_x_tilde = Some(x_tilde);
        self.previous_r = Some(r.clone());
        Ok(next)
    }

    fn on_time_window_complete(&mut self) {
        self.previous_x_tilde = None;
        self.previous_r = None;
        if self.force_initial_relaxation {
            self.history.clear(self.n);
        } else if let Some(keep) = self.timesteps_reused {
            self.history.truncate_to(keep, self.n);
        }
    }

    fn deleted_columns(&self) -> usize {
        self.history.deleted_columns
    }
}

/// Explicit approximate inverse Jacobian, updated either by a single
/// rank-1 secant correction per iteration or rebuilt from the full `V`/`W`
/// history each iteration (`always_build_jacobian`), used by both
/// [`IqnImvj`] and [`Broyden`].
struct ApproxInverseJacobian {
    j: Matrix,
}

impl ApproxInverseJacobian {
    fn zero(n: usize) -> Self {
        Self { j: Matrix::zeros(n, n) }
    }

    fn apply(&self, r: &Vector) -> Vector {
        &self.j * r
    }

    /// Good-Broyden-style rank-1 correction: `J += (dw - J dv) dv^T / (dv^T dv)`.
    fn rank_one_update(&mut self, dv: &Vector, dw: &Vector) {
        let denom = dv.dot(dv);
        if denom <= 0.0 {
            return;
        }
        let correction = dw - self.apply(dv);
        self.j += (correction / denom) * dv.transpose();
    }

    /// Rebuild from scratch via the least-squares fit `J V ~= W`, i.e.
    /// `J = W V^+`, using the maintained QR of `V` to avoid a second
    /// factorization.
    fn rebuild_from_history(&mut self, history: &SecantHistory, n: usize) {
        if history.rank() == 0 {
            return;
        }
        let mut j = Matrix::zeros(n, n);
        for col in 0..n {
            let mut e = Vector::zeros(n);
            e[col] = 1.0;
            if let Ok(alpha) = history.qr.solve_least_squares(&e) {
                let (w_alpha, _) = history_combination(history, &alpha, n);
                j.set_column(col, &w_alpha);
            }
        }
        self.j = j;
    }

    /// Additive block secant update over the full history:
    /// `J_{k+1} = J_k + (W - J_k V)(V^T V)^{-1} V^T`, computed columnwise via
    /// the maintained QR of `V` rather than forming `(V^T V)^{-1}` directly.
    /// Unlike [`Self::rank_one_update`], this uses every column currently
    /// held in `history`, not just the most recent pair.
    fn block_update(&mut self, history: &SecantHistory, n: usize) {
        if history.rank() == 0 {
            return;
        }
        let mut delta = Matrix::zeros(n, n);
        for col in 0..n {
            let mut e = Vector::zeros(n);
            e[col] = 1.0;
            if let Ok(alpha) = history.qr.solve_least_squares(&e) {
                let (w_alpha, v_alpha) = history_combination(history, &alpha, n);
                let j_v_alpha = self.apply(&v_alpha);
                delta.set_column(col, &(w_alpha - j_v_alpha));
            }
        }
        self.j += delta;
    }
}

/// IQN-IMVJ: maintains an explicit approximate inverse Jacobian across time
/// windows, with one of four restart policies applied at each window
/// boundary.
pub struct IqnImvj {
    initial_relaxation: f64,
    filter: FilterKind,
    restart: ImvjRestartMode,
    always_build_jacobian: bool,
    history: SecantHistory,
    jacobian: ApproxInverseJacobian,
    previous_x_tilde: Option<Vector>,
    previous_r: Option<Vector>,
    force_initial_relaxation: bool,
    n: usize,
}

impl IqnImvj {
    /// Build with the restart mode and Jacobian-rebuild policy from
    /// configuration.
    pub fn new(
        initial_relaxation: f64,
        filter: FilterKind,
        restart: ImvjRestartMode,
        always_build_jacobian: bool,
        max_columns_used: usize,
    ) -> Self {
        Self {
            initial_relaxation,
            filter,
            restart,
            always_build_jacobian,
            history: SecantHistory::new(0, max_columns_used.max(1)),
            jacobian: ApproxInverseJacobian::zero(0),
            previous_x_tilde: None,
            previous_r: None,
            force_initial_relaxation: false,
            n: 0,
        }
    }

    /// `forceInitialRelaxation`: if `true`, both the history and the
    /// explicit Jacobian are dropped at every time window's end, on top of
    /// whatever `restart` mode is configured.
    pub fn with_force_initial_relaxation(mut self, force: bool) -> Self {
        self.force_initial_relaxation = force;
        self
    }
}

impl Accelerator for IqnImvj {
    fn initialize(&mut self, layout: &StackedLayout) {
        self.n = layout.total();
        self.history = SecantHistory::new(self.n, self.history.max_columns);
        self.jacobian = ApproxInverseJacobian::zero(self.n);
        self.previous_x_tilde = None;
        self.previous_r = None;
    }

    fn perform_acceleration(
        &mut self,
        x: &Vector,
        r: &Vector,
        preconditioner: &mut Preconditioner,
    ) -> Result<Vector, AccelerationError> {
        check_lengths(x, r)?;
        let x_tilde = x + r;

        let next = if let (Some(prev_xt), Some(prev_r)) =
            (self.previous_x_tilde.clone(), self.previous_r.clone())
        {
            let dv = preconditioner.apply_vector(&(r - &prev_r))?;
            let dw = &x_tilde - &prev_xt;
            self.history.push(dv.clone(), dw.clone(), self.filter)?;

            if self.always_build_jacobian {
                self.jacobian.rebuild_from_history(&self.history, self.n);
            } else {
                self.jacobian.block_update(&self.history, self.n);
            }

            let scaled_r = preconditioner.apply_vector(r)?;
            x - self.jacobian.apply(&scaled_r)
        } else {
            x + r * self.initial_relaxation
        };

        self.previous_x_tilde = Some(x_tilde);
        self.previous_r = Some(r.clone());
        Ok(next)
    }

    fn on_time_window_complete(&mut self) {
        self.previous_x_tilde = None;
        self.previous_r = None;
        match self.restart {
            ImvjRestartMode::NoRestart => {}
            ImvjRestartMode::Rs0 => {
                self.history.clear(self.n);
                self.jacobian = ApproxInverseJacobian::zero(self.n);
            }
            ImvjRestartMode::RsLs { reused_timesteps_at_restart } => {
                self.history.truncate_to(reused_timesteps_at_restart as usize, self.n);
            }
            ImvjRestartMode::RsSvd { truncation_threshold } => {
                let truncated = TruncatedSvd::from_matrix(&self.jacobian.j, truncation_threshold);
                self.jacobian.j = truncated.to_dense();
                self.history.clear(self.n);
            }
            ImvjRestartMode::RsSlide { chunk_size } => {
                self.history.truncate_to(chunk_size as usize, self.n);
            }
        }
        if self.force_initial_relaxation {
            self.history.clear(self.n);
            self.jacobian = ApproxInverseJacobian::zero(self.n);
        }
    }

    fn deleted_columns(&self) -> usize {
        self.history.deleted_columns
    }
}

/// Broyden's second method: a single-pair rank-1 secant update of an
/// explicit approximate inverse Jacobian, carried across the whole run with
/// no restart.
pub struct Broyden {
    initial_relaxation: f64,
    jacobian: ApproxInverseJacobian,
    previous_x_tilde: Option<Vector>,
    previous_r: Option<Vector>,
    force_initial_relaxation: bool,
    n: usize,
}

impl Broyden {
    /// Build with the given first-iteration relaxation factor.
    pub fn new(initial_relaxation: f64) -> Self {
        Self {
            initial_relaxation,
            jacobian: ApproxInverseJacobian::zero(0),
            previous_x_tilde: None,
            previous_r: None,
            force_initial_relaxation: false,
            n: 0,
        }
    }

    /// `forceInitialRelaxation`: if `true`, the Jacobian is dropped at every
    /// time window's end instead of being carried across the whole run.
    pub fn with_force_initial_relaxation(mut self, force: bool) -> Self {
        self.force_initial_relaxation = force;
        self
    }
}

impl Accelerator for Broyden {
    fn initialize(&mut self, layout: &StackedLayout) {
        self.n = layout.total();
        self.jacobian = ApproxInverseJacobian::zero(self.n);
        self.previous_x_tilde = None;
        self.previous_r = None;
    }

    fn perform_acceleration(
        &mut self,
        x: &Vector,
        r: &Vector,
        preconditioner: &mut Preconditioner,
    ) -> Result<Vector, AccelerationError> {
        check_lengths(x, r)?;
        let x_tilde = x + r;

        let next = if let (Some(prev_xt), Some(prev_r)) =
            (self.previous_x_tilde.clone(), self.previous_r.clone())
        {
            let dv = preconditioner.apply_vector(&(r - &prev_r))?;
            let dw = &x_tilde - &prev_xt;
            self.jacobian.rank_one_update(&dv, &dw);
            let scaled_r = preconditioner.apply_vector(r)?;
            x - self.jacobian.apply(&scaled_r)
        } else {
            x + r * self.initial_relaxation
        };

        self.previous_x_tilde = Some(x_tilde);
        self.previous_r = Some(r.clone());
        Ok(next)
    }

    fn on_time_window_complete(&mut self) {
        self.previous_x_tilde = None;
        self.previous_r = None;
        if self.force_initial_relaxation {
            self.jacobian = ApproxInverseJacobian::zero(self.n);
        }
    }
}
