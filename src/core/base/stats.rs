use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::cmp::Ordering;

/////////////////////
// Enums | Helpers //
/////////////////////

/// The two-sample test to run per gene
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DgeMethod {
    /// Kolmogorov-Smirnov test
    #[default]
    #[serde(rename = "ksTest", alias = "default")]
    KsTest,
    /// Wilcoxon rank-sum test
    #[serde(rename = "wilcoxon")]
    Wilcoxon,
}

/// Helper function to get the DGE method
///
/// ### Params
///
/// * `s` - String, type of test to run.
///
/// ### Returns
///
/// Option of the `DgeMethod`
pub fn get_dge_method(s: &str) -> Option<DgeMethod> {
    match s.to_lowercase().as_str() {
        "default" | "kstest" => Some(DgeMethod::KsTest),
        "wilcoxon" => Some(DgeMethod::Wilcoxon),
        _ => None,
    }
}

/// Sign of a value, with zero mapping to zero
#[inline]
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

////////////////
// Structures //
////////////////

/// Score of one gene before any threshold is applied
///
/// ### Fields
///
/// * `z` - Absolute z-score.
/// * `sign` - Direction, positive when group A is higher. Zero if undecided.
/// * `fold` - Fold change estimate in `[-1, 1]`.
/// * `mean` - Log ratio of the group means (KS) or the overall mean
///   expression (Wilcoxon).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneScore {
    pub z: f64,
    pub sign: f64,
    pub fold: f64,
    pub mean: f64,
}

impl GeneScore {
    /// The signed z-score
    pub fn signed_z(&self) -> f64 {
        self.z * self.sign
    }
}

///////////////
// Functions //
///////////////

/// Sort the values of one group and drop the leading zeros
///
/// ### Params
///
/// * `values` - Expression values of the group.
///
/// ### Returns
///
/// The sorted values without the zeros at their start.
pub fn prepare_group<I>(values: I) -> Vec<f64>
where
    I: IntoIterator<Item = f32>,
{
    let mut sorted: Vec<f64> = values.into_iter().map(|v| v as f64).collect();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));

    let first_non_zero = sorted.iter().position(|&v| v != 0.0).unwrap_or(sorted.len());
    sorted.split_off(first_non_zero)
}

/// Kolmogorov-Smirnov statistic of two sorted groups
///
/// Walks both groups once in merged order. The maximal absolute difference of
/// the two empirical CDFs gives the statistic; the area between them over the
/// observed value range gives the fold estimate.
///
/// ### Params
///
/// * `a` - Sorted, non-empty values of group A.
/// * `b` - Sorted, non-empty values of group B.
///
/// ### Returns
///
/// The `GeneScore`
pub fn ks_test(a: &[f64], b: &[f64]) -> GeneScore {
    let (na, nb) = (a.len(), b.len());
    let (na_f, nb_f) = (na as f64, nb as f64);

    let first_x = a[0].min(b[0]);
    let mut prev_x = first_x;
    let mut cur_x = first_x;

    let mut curr_d = 0.0;
    let mut fold = 0.0;
    let mut d = 0.0;
    let mut d_sign = 0.0;

    let (mut ia, mut ib) = (0_usize, 0_usize);

    while ia < na && ib < nb {
        fold += (cur_x - prev_x) * curr_d;
        prev_x = cur_x;
        cur_x = a[ia].min(b[ib]);

        match a[ia].total_cmp(&b[ib]) {
            Ordering::Less => ia += 1,
            Ordering::Greater => ib += 1,
            Ordering::Equal => {
                while ia < na && ib < nb && a[ia] == b[ib] {
                    ia += 1;
                    ib += 1;
                }
            }
        }

        curr_d = ib as f64 / nb_f - ia as f64 / na_f;
        if curr_d.abs() > d {
            d = curr_d.abs();
            d_sign = sign(curr_d);
        }
    }

    // one group is exhausted, its CDF sits at 1
    while ib < nb {
        fold += (cur_x - prev_x) * curr_d;
        prev_x = cur_x;
        cur_x = b[ib];
        ib += 1;
        curr_d = ib as f64 / nb_f - 1.0;
    }
    while ia < na {
        fold += (cur_x - prev_x) * curr_d;
        prev_x = cur_x;
        cur_x = a[ia];
        ia += 1;
        curr_d = 1.0 - ia as f64 / na_f;
    }
    fold += (cur_x - prev_x) * curr_d;

    let range = cur_x - first_x;
    let fold = if range > 0.0 {
        (fold / range).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    let total_a: f64 = a.iter().sum();
    let total_b: f64 = b.iter().sum();
    let mean = (total_a / na_f).ln() - (total_b / nb_f).ln();

    let z = d * (na_f * nb_f / (na_f + nb_f)).sqrt();

    GeneScore {
        z,
        sign: d_sign,
        fold,
        mean,
    }
}

/// Wilcoxon rank-sum statistic of two sorted groups
///
/// Ties between the groups count half. Uses the normal approximation of the
/// rank-sum.
///
/// ### Params
///
/// * `a` - Sorted, non-empty values of group A.
/// * `b` - Sorted, non-empty values of group B.
///
/// ### Returns
///
/// The `GeneScore`
pub fn wilcoxon_test(a: &[f64], b: &[f64]) -> GeneScore {
    let (na, nb) = (a.len() as f64, b.len() as f64);

    let mut total_a_rank = 0.0;
    let mut total = 0.0;
    let mut index = 0_usize;

    for (i, &bv) in b.iter().enumerate() {
        while index < a.len() && a[index] <= bv {
            total_a_rank += if a[index] == bv {
                i as f64 + 0.5
            } else {
                i as f64
            };
            total += a[index];
            index += 1;
        }
        total += bv;
    }
    for &av in &a[index..] {
        total_a_rank += nb;
        total += av;
    }

    let total_b_rank = na * nb - total_a_rank;

    let fold = if total_b_rank == 0.0 {
        1.0
    } else {
        (total_a_rank / total_b_rank).min(1.0)
    };

    let mu = na * nb / 2.0;
    let sigma = (na * nb * (na + nb + 1.0) / 12.0).sqrt();
    let highest = total_a_rank.max(total_b_rank);
    let z = ((highest - mu) / sigma).abs();
    let sign = if highest == total_a_rank { 1.0 } else { -1.0 };

    GeneScore {
        z,
        sign,
        fold,
        mean: total / (na + nb),
    }
}

/// Transform a Z-score into a two-sided p-value (assuming normality)
///
/// ### Params
///
/// * `z` - The Z score
///
/// ### Returns
///
/// The p-value. Far in the tail a Mills ratio approximation is used.
pub fn z_to_pval(z: f64) -> f64 {
    let normal = Normal::standard();
    let abs_z = z.abs();
    if abs_z > 6.0 {
        let pdf = normal.pdf(abs_z);
        2.0 * pdf / abs_z * (1.0 - 1.0 / (abs_z * abs_z))
    } else {
        2.0 * (1.0 - normal.cdf(abs_z))
    }
}
