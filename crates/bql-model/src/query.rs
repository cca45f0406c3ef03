//! Predictive queries against one model and against an ensemble

use std::collections::HashMap;

use rand::Rng;

use crate::component::{sample_log_weights, stats_for, Stats};
use crate::state::{LatentState, CRP_ALPHA};
use crate::types::{Dataset, Datum};
use crate::ModelError;

impl LatentState {
    fn cluster_stats(&self, data: &Dataset, col: usize, cluster: usize, exclude: Option<usize>) -> Stats {
        let view = &self.views[self.column_view[col]];
        stats_for(data.prior(col), data.column(col), |r| {
            view.row_cluster[r] == cluster && Some(r) != exclude
        })
    }

    /// 1 or 0 for the view holding `column`, otherwise the share of views
    /// in which both rows sit in the same cluster.
    pub fn similarity(&self, a: usize, b: usize, column: Option<usize>) -> f64 {
        match column {
            Some(col) => {
                let view = &self.views[self.column_view[col]];
                f64::from(u8::from(view.row_cluster[a] == view.row_cluster[b]))
            }
            None => {
                let same = self
                    .views
                    .iter()
                    .filter(|v| v.row_cluster[a] == v.row_cluster[b])
                    .count();
                same as f64 / self.views.len().max(1) as f64
            }
        }
    }

    pub fn row_typicality(&self, row: usize) -> f64 {
        let total: f64 = self
            .views
            .iter()
            .map(|v| {
                let k = v.row_cluster[row];
                let size = v.row_cluster.iter().filter(|x| **x == k).count();
                size as f64 / v.row_cluster.len().max(1) as f64
            })
            .sum();
        total / self.views.len().max(1) as f64
    }

    pub fn column_typicality(&self, col: usize) -> f64 {
        let view = &self.views[self.column_view[col]];
        view.columns.len() as f64 / self.column_view.len().max(1) as f64
    }

    pub fn same_view(&self, a: usize, b: usize) -> bool {
        self.column_view[a] == self.column_view[b]
    }

    /// The row's cluster component for `col`, without the cell itself.
    fn cell_component(&self, data: &Dataset, row: usize, col: usize) -> Stats {
        let cluster = self.views[self.column_view[col]].row_cluster[row];
        self.cluster_stats(data, col, cluster, Some(row))
    }

    /// Probability (multinomial) or density (continuous) of `datum` in cell
    /// `(row, col)`, given the row's cluster without the cell itself.
    pub fn predictive_probability(&self, data: &Dataset, row: usize, col: usize, datum: Datum) -> f64 {
        self.cell_component(data, row, col)
            .log_predictive(data.prior(col), datum)
            .exp()
    }

    /// Draw the `targets` of a hypothetical new row that matches `givens`.
    pub fn sample_new_row<R: Rng + ?Sized>(
        &self,
        data: &Dataset,
        givens: &[(usize, Datum)],
        targets: &[usize],
        rng: &mut R,
    ) -> Vec<Datum> {
        let mut chosen: HashMap<usize, usize> = HashMap::new();
        let mut row = Vec::with_capacity(targets.len());
        for col in targets {
            let v = self.column_view[*col];
            let cluster = match chosen.get(&v) {
                Some(k) => *k,
                None => {
                    let k = self.sample_new_row_cluster(data, v, givens, rng);
                    chosen.insert(v, k);
                    k
                }
            };
            let stats = if cluster < self.views[v].num_clusters() {
                self.cluster_stats(data, *col, cluster, None)
            } else {
                data.prior(*col).empty_stats()
            };
            row.push(stats.sample(data.prior(*col), rng));
        }
        row
    }

    /// Cluster for a new row in view `v`: CRP weight times likelihood of the
    /// givens that live in that view. `num_clusters` means a fresh cluster.
    fn sample_new_row_cluster<R: Rng + ?Sized>(
        &self,
        data: &Dataset,
        v: usize,
        givens: &[(usize, Datum)],
        rng: &mut R,
    ) -> usize {
        let view = &self.views[v];
        let sizes = view.cluster_sizes();
        let in_view: Vec<&(usize, Datum)> = givens.iter().filter(|(c, _)| self.column_view[*c] == v).collect();
        let mut weights: Vec<f64> = sizes
            .iter()
            .enumerate()
            .map(|(k, size)| {
                in_view.iter().fold((*size as f64).ln(), |acc, (col, datum)| {
                    acc + self
                        .cluster_stats(data, *col, k, None)
                        .log_predictive(data.prior(*col), *datum)
                })
            })
            .collect();
        weights.push(in_view.iter().fold(CRP_ALPHA.ln(), |acc, (col, datum)| {
            acc + data.prior(*col).empty_stats().log_predictive(data.prior(*col), *datum)
        }));
        sample_log_weights(rng, &weights)
    }
}

/// Component means closer than this many column standard deviations count
/// as the same imputed value.
pub const AGREEMENT_TOLERANCE: f64 = 0.2;

/// An imputed value and the share of samples supporting it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Imputation {
    pub value: Datum,
    pub confidence: f64,
}

/// All models of a btable, queried together.
#[derive(Debug, Clone, Copy)]
pub struct Ensemble<'a> {
    data: &'a Dataset,
    states: &'a [LatentState],
}

impl<'a> Ensemble<'a> {
    pub fn new(data: &'a Dataset, states: &'a [LatentState]) -> Result<Self, ModelError> {
        if states.is_empty() {
            return Err(ModelError::EmptyEnsemble);
        }
        for state in states {
            state.validate(data)?;
        }
        Ok(Self { data, states })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn mean(&self, f: impl Fn(&LatentState) -> f64) -> f64 {
        self.states.iter().map(f).sum::<f64>() / self.states.len() as f64
    }

    pub fn similarity(&self, a: usize, b: usize, column: Option<usize>) -> f64 {
        self.mean(|s| s.similarity(a, b, column))
    }

    pub fn row_typicality(&self, row: usize) -> f64 {
        self.mean(|s| s.row_typicality(row))
    }

    pub fn column_typicality(&self, col: usize) -> f64 {
        self.mean(|s| s.column_typicality(col))
    }

    /// Fraction of models in which the two columns share a view.
    pub fn dependence_probability(&self, a: usize, b: usize) -> f64 {
        self.mean(|s| f64::from(u8::from(s.same_view(a, b))))
    }

    pub fn predictive_probability(&self, row: usize, col: usize, datum: Datum) -> f64 {
        self.mean(|s| s.predictive_probability(self.data, row, col, datum))
    }

    /// Impute cell `(row, col)` from `samples` draws, cycling through the models.
    ///
    /// Multinomial cells take the most frequent draw. Continuous cells pool
    /// the draws of every model whose component mean lies within
    /// [`AGREEMENT_TOLERANCE`] column deviations of the others, take the
    /// largest such pool, and report its share of all draws as confidence.
    pub fn impute<R: Rng + ?Sized>(&self, row: usize, col: usize, samples: usize, rng: &mut R) -> Option<Imputation> {
        if samples == 0 {
            return None;
        }
        let prior = self.data.prior(col);
        let components: Vec<Stats> = self
            .states
            .iter()
            .map(|s| s.cell_component(self.data, row, col))
            .collect();
        let draws: Vec<(Datum, usize)> = (0..samples)
            .map(|i| {
                let m = i % components.len();
                (components[m].sample(prior, rng), m)
            })
            .collect();

        match draws[0].0 {
            Datum::Code(_) => {
                let mut counts: HashMap<usize, usize> = HashMap::new();
                for (datum, _) in &draws {
                    if let Datum::Code(code) = datum {
                        *counts.entry(*code).or_default() += 1;
                    }
                }
                let (code, count) = counts
                    .into_iter()
                    .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))?;
                Some(Imputation {
                    value: Datum::Code(code),
                    confidence: count as f64 / samples as f64,
                })
            }
            Datum::Real(_) => {
                let means: Vec<Option<f64>> = components.iter().map(|c| c.posterior_mean(prior)).collect();
                let mut centered: Vec<(f64, f64)> = draws
                    .iter()
                    .filter_map(|(datum, m)| match datum {
                        Datum::Real(x) => Some((means[*m]?, *x)),
                        Datum::Code(_) => None,
                    })
                    .collect();
                centered.sort_by(|a, b| a.0.total_cmp(&b.0));

                // Widest run of draws whose component means span at most the tolerance.
                let tolerance = AGREEMENT_TOLERANCE * prior.scale();
                let (mut best, mut start) = (0..0, 0);
                for end in 0..centered.len() {
                    while centered[end].0 - centered[start].0 > tolerance {
                        start += 1;
                    }
                    if end + 1 - start > best.len() {
                        best = start..end + 1;
                    }
                }
                let agreeing = &centered[best];
                if agreeing.is_empty() {
                    return None;
                }
                let value = agreeing.iter().map(|(_, x)| x).sum::<f64>() / agreeing.len() as f64;
                Some(Imputation {
                    value: Datum::Real(value),
                    confidence: agreeing.len() as f64 / samples as f64,
                })
            }
        }
    }

    /// `times` hypothetical rows, each drawn from a uniformly chosen model.
    pub fn simulate<R: Rng + ?Sized>(
        &self,
        givens: &[(usize, Datum)],
        targets: &[usize],
        times: usize,
        rng: &mut R,
    ) -> Vec<Vec<Datum>> {
        (0..times)
            .map(|_| {
                let m = rng.gen_range(0..self.states.len());
                self.states[m].sample_new_row(self.data, givens, targets, rng)
            })
            .collect()
    }
}
