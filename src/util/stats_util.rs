use num_traits::ToPrimitive;

pub fn mean<'a, I, T>(iter: I) -> f64
    where I: Iterator<Item = &'a T>, T: 'a + Copy + ToPrimitive {
    let mut sum = 0f64;
    let mut count = 0usize;
    for x in iter {
        sum += x.to_f64().unwrap();
        count += 1;
    }
    sum / count as f64
}

/// `ddof`: delta degrees of freedom; the denominator is `n - ddof`.
pub fn std<'a, I, T>(iter: I, ddof: usize) -> f64
    where I: Iterator<Item = &'a T> + Clone, T: 'a + Copy + ToPrimitive {
    let m = mean(iter.clone());
    let mut ssq = 0f64;
    let mut count = 0usize;
    for x in iter {
        let d = x.to_f64().unwrap() - m;
        ssq += d * d;
        count += 1;
    }
    (ssq / (count - ddof) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::{mean, std};

    #[test]
    fn test_moments() {
        let v = vec![1f64, 2., 3., 4.];
        assert!((mean(v.iter()) - 2.5).abs() < 1e-12);
        let s = std(v.iter(), 1);
        assert!((s * s - 5. / 3.).abs() < 1e-12);
        let s0 = std(v.iter(), 0);
        assert!((s0 * s0 - 1.25).abs() < 1e-12);
    }
}
