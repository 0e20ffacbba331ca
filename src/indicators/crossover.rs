// =============================================================================
// Price / indicator crossover
// =============================================================================
//
//   Above: prev_price <= prev_hma  &&  curr_price > curr_hma
//   Below: prev_price >= prev_hma  &&  curr_price < curr_hma
//
// A missing indicator value on either side yields `None`.
// =============================================================================

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Crossover {
    Above,
    Below,
    None,
}

pub fn detect_crossover(
    prev_price: f64,
    curr_price: f64,
    prev_hma: Option<f64>,
    curr_hma: Option<f64>,
) -> Crossover {
    let (Some(prev_hma), Some(curr_hma)) = (prev_hma, curr_hma) else {
        return Crossover::None;
    };
    if prev_price <= prev_hma && curr_price > curr_hma {
        Crossover::Above
    } else if prev_price >= prev_hma && curr_price < curr_hma {
        Crossover::Below
    } else {
        Crossover::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_crossing_up_is_above() {
        assert_eq!(
            detect_crossover(100.0, 110.0, Some(105.0), Some(108.0)),
            Crossover::Above
        );
    }

    #[test]
    fn price_crossing_down_is_below() {
        assert_eq!(
            detect_crossover(110.0, 100.0, Some(105.0), Some(104.0)),
            Crossover::Below
        );
    }

    #[test]
    fn touching_then_leaving_counts() {
        assert_eq!(detect_crossover(105.0, 106.0, Some(105.0), Some(105.5)), Crossover::Above);
    }

    #[test]
    fn staying_on_one_side_is_none() {
        assert_eq!(detect_crossover(110.0, 111.0, Some(105.0), Some(106.0)), Crossover::None);
        assert_eq!(detect_crossover(100.0, 101.0, Some(105.0), Some(106.0)), Crossover::None);
    }

    #[test]
    fn missing_indicator_is_none() {
        assert_eq!(detect_crossover(100.0, 110.0, None, Some(108.0)), Crossover::None);
        assert_eq!(detect_crossover(100.0, 110.0, Some(105.0), None), Crossover::None);
    }
}
