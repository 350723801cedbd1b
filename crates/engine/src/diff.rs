//! Line-level comparison of expected and actual program output.

/// Above this many table cells the diff stops aligning lines and reports a
/// full replacement instead.
const MAX_LCS_CELLS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op<'a> {
    Keep(&'a str),
    Remove(&'a str),
    Add(&'a str),
}

/// Longest-common-subsequence table over lines, stored row-major with one
/// extra row and column.
struct LcsTable {
    cols: usize,
    cells: Vec<usize>,
}

impl LcsTable {
    fn build(a: &[&str], b: &[&str]) -> Self {
        let cols = b.len() + 1;
        let mut cells = vec![0usize; (a.len() + 1) * cols];
        for (i, line_a) in a.iter().enumerate().rev() {
            for (j, line_b) in b.iter().enumerate().rev() {
                let value = if line_a == line_b {
                    Self::read(&cells, cols, i + 1, j + 1) + 1
                } else {
                    Self::read(&cells, cols, i + 1, j).max(Self::read(&cells, cols, i, j + 1))
                };
                if let Some(cell) = cells.get_mut(i * cols + j) {
                    *cell = value;
                }
            }
        }
        Self { cols, cells }
    }

    fn read(cells: &[usize], cols: usize, i: usize, j: usize) -> usize {
        cells.get(i * cols + j).copied().unwrap_or(0)
    }

    fn at(&self, i: usize, j: usize) -> usize {
        Self::read(&self.cells, self.cols, i, j)
    }
}

fn edit_script<'a>(a: &[&'a str], b: &[&'a str]) -> Vec<Op<'a>> {
    if a.len().saturating_mul(b.len()) > MAX_LCS_CELLS {
        let mut ops: Vec<Op<'a>> = a.iter().copied().map(Op::Remove).collect();
        ops.extend(b.iter().copied().map(Op::Add));
        return ops;
    }

    let table = LcsTable::build(a, b);
    let mut ops = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    loop {
        match (a.get(i), b.get(j)) {
            (Some(la), Some(lb)) if la == lb => {
                ops.push(Op::Keep(*la));
                i += 1;
                j += 1;
            }
            (Some(la), Some(_)) if table.at(i + 1, j) >= table.at(i, j + 1) => {
                ops.push(Op::Remove(*la));
                i += 1;
            }
            (_, Some(lb)) => {
                ops.push(Op::Add(*lb));
                j += 1;
            }
            (Some(la), None) => {
                ops.push(Op::Remove(*la));
                i += 1;
            }
            (None, None) => break,
        }
    }
    ops
}

/// Unified-style line diff: `-` lines only in `expected`, `+` lines only in
/// `actual`, two spaces for common lines. Empty when identical.
pub fn line_diff(expected: &str, actual: &str) -> String {
    if expected == actual {
        return String::new();
    }
    let a: Vec<&str> = expected.lines().collect();
    let b: Vec<&str> = actual.lines().collect();

    let mut out = String::new();
    for op in edit_script(&a, &b) {
        let (prefix, line) = match op {
            Op::Keep(l) => ("  ", l),
            Op::Remove(l) => ("-", l),
            Op::Add(l) => ("+", l),
        };
        out.push_str(prefix);
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Share of lines the two outputs have in common, from 0.0 to 1.0.
pub fn similarity(expected: &str, actual: &str) -> f64 {
    if expected == actual {
        return 1.0;
    }
    let a: Vec<&str> = expected.lines().collect();
    let b: Vec<&str> = actual.lines().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let common = edit_script(&a, &b)
        .iter()
        .filter(|op| matches!(op, Op::Keep(_)))
        .count();
    (2 * common) as f64 / total as f64
}
