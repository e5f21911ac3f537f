pub fn div_or_zero(lhs: f32, rhs: f32) -> f32 {
    if rhs == 0.0 {
        0.0
    } else {
        lhs / rhs
    }
}

pub fn mean(values: &[f32]) -> f32 {
    div_or_zero(values.iter().sum::<f32>(), values.len() as f32)
}

pub fn variance(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }

    let mean = mean(values);

    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / values.len() as f32
}

// Per column mean and population variance. All rows must share the width of the first row.
pub fn column_stats(rows: &[&[f32]]) -> Option<(Vec<f32>, Vec<f32>)> {
    let width = rows.first()?.len();
    let count = rows.len() as f32;

    let mut means = vec![0.0; width];
    for row in rows {
        for (mean, value) in means.iter_mut().zip(row.iter()) {
            *mean += value / count;
        }
    }

    let mut variances = vec![0.0; width];
    for row in rows {
        for ((variance, value), mean) in variances.iter_mut().zip(row.iter()).zip(means.iter()) {
            *variance += (value - mean) * (value - mean) / count;
        }
    }

    Some((means, variances))
}

pub fn euclidean(lhs: &[f32], rhs: &[f32]) -> f32 {
    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| (l - r) * (l - r))
        .sum::<f32>()
        .sqrt()
}

pub fn dot(lhs: &[f32], rhs: &[f32]) -> f32 {
    lhs.iter().zip(rhs.iter()).map(|(l, r)| l * r).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_mean() {
        assert_approx_eq!(mean(&[1.0, 2.0, 3.0, 4.0]), 2.5, 0.00001);
    }

    #[test]
    fn test_mean_empty() {
        assert_approx_eq!(mean(&[]), 0.0, 0.00001);
    }

    #[test]
    fn test_variance() {
        assert_approx_eq!(variance(&[1.0, 2.0, 3.0, 4.0]), 1.25, 0.00001);
    }

    #[test]
    fn test_variance_uniform() {
        assert_approx_eq!(variance(&[2.0, 2.0, 2.0]), 0.0, 0.00001);
    }

    #[test]
    fn test_column_stats() {
        let rows: Vec<&[f32]> = vec![&[1.0, 10.0], &[3.0, 30.0]];

        let (means, variances) = column_stats(&rows).unwrap();

        assert_approx_eq!(means[0], 2.0, 0.00001);
        assert_approx_eq!(means[1], 20.0, 0.00001);
        assert_approx_eq!(variances[0], 1.0, 0.00001);
        assert_approx_eq!(variances[1], 100.0, 0.00001);
    }

    #[test]
    fn test_column_stats_empty() {
        assert!(column_stats(&[]).is_none());
    }

    #[test]
    fn test_euclidean() {
        assert_approx_eq!(euclidean(&[0.0, 0.0], &[3.0, 4.0]), 5.0, 0.00001);
    }

    #[test]
    fn test_dot() {
        assert_approx_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0, 0.00001);
    }
}
