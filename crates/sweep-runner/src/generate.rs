//! Expansion of sweep parameters into concrete instances.
//!
//! Linear parameters advance together along a shared sweep index; each linear
//! instance is then crossed with every combinatoric parameter. The
//! first-declared combinatoric parameter varies slowest.

use crate::error::{Error, Result};
use crate::params::{Mode, ParameterDeclaration, ScalarValue};
use std::collections::{BTreeMap, BTreeSet};

/// One fully resolved assignment: linear parameters first, then
/// combinatoric ones, each group in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance<'a> {
    pub assignments: Vec<(&'a ParameterDeclaration, &'a ScalarValue)>,
}

impl<'a> Instance<'a> {
    /// `N10_threads2` style name: `_<name><value>` per parameter, leading
    /// separator stripped.
    pub fn name(&self) -> String {
        let mut out = String::new();
        for (param, value) in &self.assignments {
            out.push('_');
            out.push_str(&param.name);
            out.push_str(&value.to_string());
        }
        if out.starts_with('_') {
            out.remove(0);
        }
        out
    }
}

/// Validated sweep: linear lengths agree and combinatoric cardinalities are
/// known.
#[derive(Debug, Clone)]
pub struct SweepPlan<'a> {
    linear: Vec<&'a ParameterDeclaration>,
    combinatoric: Vec<&'a ParameterDeclaration>,
    linear_len: usize,
    count: usize,
}

impl<'a> SweepPlan<'a> {
    pub fn new(parameters: &'a [ParameterDeclaration]) -> Result<Self> {
        if parameters.is_empty() {
            return Err(Error::SweepValidation(
                "no sweep parameters declared".to_string(),
            ));
        }
        let linear: Vec<_> = parameters
            .iter()
            .filter(|p| p.mode == Mode::Linear)
            .collect();
        let combinatoric: Vec<_> = parameters
            .iter()
            .filter(|p| p.mode == Mode::Combinatoric)
            .collect();

        // One name may feed several files; within a file it must be unique.
        let mut seen = BTreeSet::new();
        for p in parameters {
            let key = (p.target_section, p.target_file.as_str(), p.name.as_str());
            if !seen.insert(key) {
                return Err(Error::SweepValidation(format!(
                    "parameter '{}' declared twice for {}/{}",
                    p.name,
                    p.target_section.dir_name(),
                    p.target_file
                )));
            }
        }

        // A purely combinatoric sweep has a single, empty linear instance.
        let linear_len = match linear.first() {
            Some(first) => first.values.len(),
            None => 1,
        };
        if let Some(bad) = linear.iter().find(|p| p.values.len() != linear_len) {
            return Err(Error::SweepValidation(format!(
                "all linear parameters must have the same number of values: '{}' has {}, '{}' has {}",
                linear[0].name,
                linear_len,
                bad.name,
                bad.values.len()
            )));
        }

        let count = combinatoric
            .iter()
            .try_fold(linear_len, |acc, p| acc.checked_mul(p.values.len()))
            .ok_or_else(|| {
                Error::SweepValidation(format!(
                    "sweep is too large: the product of {} combinatoric parameters overflows",
                    combinatoric.len()
                ))
            })?;

        Ok(Self {
            linear,
            combinatoric,
            linear_len,
            count,
        })
    }

    pub fn linear_len(&self) -> usize {
        self.linear_len
    }

    /// `L * product(|values_j|)` over combinatoric parameters.
    pub fn instance_count(&self) -> usize {
        self.count
    }

    pub fn instances(&self) -> Instances<'_, 'a> {
        Instances {
            plan: self,
            sweep_index: 0,
            product: MixedRadix::new(self.combinatoric.iter().map(|p| p.values.len()).collect()),
        }
    }

    /// Expands every instance and rejects sweeps whose names collide or
    /// cannot be used as directory names.
    pub fn named_instances(&self) -> Result<Vec<(String, Instance<'a>)>> {
        let mut seen = BTreeMap::new();
        let mut out = Vec::with_capacity(self.instance_count());
        for (idx, instance) in self.instances().enumerate() {
            let name = instance.name();
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                return Err(Error::SweepValidation(format!(
                    "instance {} resolves to unusable case name '{}'",
                    idx, name
                )));
            }
            if let Some(prev) = seen.insert(name.clone(), idx) {
                return Err(Error::SweepValidation(format!(
                    "instances {} and {} both resolve to case name '{}'",
                    prev, idx, name
                )));
            }
            out.push((name, instance));
        }
        Ok(out)
    }
}

/// Lazily yields instances in sweep-index order, combinatoric product inner.
pub struct Instances<'p, 'a> {
    plan: &'p SweepPlan<'a>,
    sweep_index: usize,
    product: MixedRadix,
}

impl<'p, 'a> Iterator for Instances<'p, 'a> {
    type Item = Instance<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.sweep_index >= self.plan.linear_len {
                return None;
            }
            match self.product.next() {
                Some(digits) => {
                    let mut assignments =
                        Vec::with_capacity(self.plan.linear.len() + digits.len());
                    for &p in &self.plan.linear {
                        assignments.push((p, &p.values[self.sweep_index]));
                    }
                    for (&p, d) in self.plan.combinatoric.iter().zip(digits) {
                        assignments.push((p, &p.values[d]));
                    }
                    return Some(Instance { assignments });
                }
                None => {
                    self.sweep_index += 1;
                    self.product.reset();
                }
            }
        }
    }
}

/// Mixed-radix counter; the last digit is the fastest-varying.
#[derive(Debug, Clone)]
struct MixedRadix {
    radices: Vec<usize>,
    digits: Vec<usize>,
    exhausted: bool,
}

impl MixedRadix {
    fn new(radices: Vec<usize>) -> Self {
        let exhausted = radices.iter().any(|r| *r == 0);
        let digits = vec![0; radices.len()];
        Self {
            radices,
            digits,
            exhausted,
        }
    }

    fn reset(&mut self) {
        self.digits.iter_mut().for_each(|d| *d = 0);
        self.exhausted = self.radices.iter().any(|r| *r == 0);
    }
}

impl Iterator for MixedRadix {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.exhausted {
            return None;
        }
        let current = self.digits.clone();
        let mut pos = self.digits.len();
        loop {
            if pos == 0 {
                self.exhausted = true;
                break;
            }
            pos -= 1;
            self.digits[pos] += 1;
            if self.digits[pos] < self.radices[pos] {
                break;
            }
            self.digits[pos] = 0;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Section;

    fn param(name: &str, mode: Mode, values: Vec<ScalarValue>) -> ParameterDeclaration {
        ParameterDeclaration {
            name: name.to_string(),
            mode,
            values,
            target_file: "exec.sh".to_string(),
            target_section: Section::Exec,
        }
    }

    fn ints(values: &[i64]) -> Vec<ScalarValue> {
        values.iter().map(|v| ScalarValue::Int(*v)).collect()
    }

    fn names(plan: &SweepPlan<'_>) -> Vec<String> {
        plan.instances().map(|i| i.name()).collect()
    }

    #[test]
    fn linear_times_combinatoric_in_declaration_order() {
        let params = vec![
            param("N", Mode::Linear, ints(&[10, 20])),
            param("threads", Mode::Combinatoric, ints(&[1, 2, 4])),
        ];
        let plan = SweepPlan::new(&params).expect("valid plan");
        assert_eq!(plan.instance_count(), 6);
        assert_eq!(
            names(&plan),
            vec![
                "N10_threads1",
                "N10_threads2",
                "N10_threads4",
                "N20_threads1",
                "N20_threads2",
                "N20_threads4"
            ]
        );
    }

    #[test]
    fn first_declared_combinatoric_is_outermost() {
        let params = vec![
            param("a", Mode::Combinatoric, ints(&[1, 2])),
            param("b", Mode::Combinatoric, ints(&[7, 8, 9])),
        ];
        let plan = SweepPlan::new(&params).expect("valid plan");
        assert_eq!(
            names(&plan),
            vec!["a1_b7", "a1_b8", "a1_b9", "a2_b7", "a2_b8", "a2_b9"]
        );
    }

    #[test]
    fn linear_parameters_come_first_regardless_of_declaration() {
        let params = vec![
            param("mesh", Mode::Combinatoric, ints(&[1, 2])),
            param("N", Mode::Linear, ints(&[5])),
            param("dt", Mode::Linear, ints(&[3])),
        ];
        let plan = SweepPlan::new(&params).expect("valid plan");
        assert_eq!(names(&plan), vec!["N5_dt3_mesh1", "N5_dt3_mesh2"]);
    }

    #[test]
    fn count_is_linear_length_times_cardinalities() {
        let params = vec![
            param("x", Mode::Linear, ints(&[1, 2, 3])),
            param("y", Mode::Linear, ints(&[4, 5, 6])),
            param("p", Mode::Combinatoric, ints(&[1, 2])),
            param("q", Mode::Combinatoric, ints(&[1, 2, 3, 4])),
            param("r", Mode::Combinatoric, ints(&[1])),
        ];
        let plan = SweepPlan::new(&params).expect("valid plan");
        assert_eq!(plan.instance_count(), 3 * 2 * 4);
        assert_eq!(plan.instances().count(), 24);
    }

    #[test]
    fn mismatched_linear_lengths_fail() {
        let params = vec![
            param("N", Mode::Linear, ints(&[10, 20])),
            param("M", Mode::Linear, ints(&[1, 2, 3])),
        ];
        let err = SweepPlan::new(&params).expect_err("should fail");
        assert!(matches!(err, Error::SweepValidation(_)));
        assert!(err.to_string().contains("'M' has 3"), "{}", err);
    }

    #[test]
    fn only_linear_parameters_yield_sweep_length_instances() {
        let params = vec![param("N", Mode::Linear, ints(&[1, 2, 3]))];
        let plan = SweepPlan::new(&params).expect("valid plan");
        assert_eq!(names(&plan), vec!["N1", "N2", "N3"]);
    }

    #[test]
    fn colliding_names_are_rejected() {
        let params = vec![param(
            "tag",
            Mode::Combinatoric,
            vec![
                ScalarValue::Str("a".to_string()),
                ScalarValue::Str("a".to_string()),
            ],
        )];
        let plan = SweepPlan::new(&params).expect("valid plan");
        let err = plan.named_instances().expect_err("should fail");
        assert!(err.to_string().contains("taga"), "{}", err);
    }

    #[test]
    fn value_with_slash_is_rejected() {
        let params = vec![param(
            "dir",
            Mode::Linear,
            vec![ScalarValue::Str("a/b".to_string())],
        )];
        let plan = SweepPlan::new(&params).expect("valid plan");
        assert!(plan.named_instances().is_err());
    }

    #[test]
    fn duplicate_parameter_names_in_one_file_fail() {
        let params = vec![
            param("N", Mode::Linear, ints(&[1])),
            param("N", Mode::Combinatoric, ints(&[2])),
        ];
        let err = SweepPlan::new(&params).expect_err("should fail");
        assert!(err.to_string().contains("exec/exec.sh"), "{}", err);
    }

    #[test]
    fn same_name_may_target_several_files() {
        let mut build = param("N", Mode::Linear, ints(&[10, 20]));
        build.target_file = "config.mk".to_string();
        build.target_section = Section::Build;
        let params = vec![build, param("N", Mode::Linear, ints(&[10, 20]))];
        let plan = SweepPlan::new(&params).expect("valid plan");
        assert_eq!(names(&plan), vec!["N10_N10", "N20_N20"]);
    }

    #[test]
    fn oversized_sweep_is_rejected_instead_of_overflowing() {
        let params: Vec<_> = (0..20)
            .map(|i| param(&format!("p{}", i), Mode::Combinatoric, ints(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9])))
            .collect();
        let err = SweepPlan::new(&params).expect_err("should fail");
        assert!(matches!(err, Error::SweepValidation(_)));
        assert!(err.to_string().contains("too large"), "{}", err);
    }

    #[test]
    fn mixed_radix_counts_last_digit_fastest() {
        let seq: Vec<_> = MixedRadix::new(vec![2, 2]).collect();
        assert_eq!(seq, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        assert_eq!(MixedRadix::new(vec![]).count(), 1);
    }
}
