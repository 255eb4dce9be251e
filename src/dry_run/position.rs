// =============================================================================
// Position — weighted-average entry, realized PnL on reducing fills
// =============================================================================

use crate::fp::Fp;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub side: Side,
    pub qty: Fp,
    pub entry_price: Fp,
}

impl Position {
    pub fn notional(&self) -> Fp {
        self.qty.mul(self.entry_price)
    }

    pub fn unrealized_pnl(&self, mark_price: Fp) -> Fp {
        let diff = mark_price.sub(self.entry_price);
        let signed = if self.side == Side::Long { diff } else { diff.neg() };
        signed.mul(self.qty)
    }
}

/// Apply one fill (`fill_side` bought or sold `fill_qty` at `fill_price`) to
/// `position`, returning the realized PnL booked by the reducing portion of
/// the fill. `reduce_only` forbids the fill from opening new exposure beyond
/// flattening the current position; callers must have already clamped
/// `fill_qty` for reduce-only orders before calling this.
pub fn apply_fill(
    position: &mut Option<Position>,
    fill_side: Side,
    fill_qty: Fp,
    fill_price: Fp,
) -> Fp {
    let mut realized = Fp::ZERO;

    match position.as_mut() {
        None => {
            *position = Some(Position { side: fill_side, qty: fill_qty, entry_price: fill_price });
        }
        Some(pos) if pos.side == fill_side => {
            let total_qty = pos.qty.add(fill_qty);
            let weighted = pos.qty.mul(pos.entry_price).add(fill_qty.mul(fill_price));
            pos.entry_price = weighted.div(total_qty).unwrap_or(pos.entry_price);
            pos.qty = total_qty;
        }
        Some(pos) => {
            // Opposite side: this fill reduces (and possibly flips) the
            // existing position.
            let reduce_qty = pos.qty.min(fill_qty);
            let price_diff = fill_price.sub(pos.entry_price);
            let signed = if pos.side == Side::Long { price_diff } else { price_diff.neg() };
            realized = signed.mul(reduce_qty);

            let remaining_qty = pos.qty.sub(reduce_qty);
            let leftover = fill_qty.sub(reduce_qty);

            if remaining_qty.is_zero() {
                if leftover.is_zero() {
                    *position = None;
                } else {
                    *position = Some(Position { side: fill_side, qty: leftover, entry_price: fill_price });
                }
            } else {
                pos.qty = remaining_qty;
            }
        }
    }

    realized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(x: f64) -> Fp {
        Fp::to_fp(x).unwrap()
    }

    #[test]
    fn opening_fill_sets_entry_price() {
        let mut pos = None;
        apply_fill(&mut pos, Side::Long, fp(2.0), fp(100.0));
        let p = pos.unwrap();
        assert_eq!(p.qty, fp(2.0));
        assert_eq!(p.entry_price, fp(100.0));
    }

    #[test]
    fn same_side_fill_weights_entry_price() {
        let mut pos = Some(Position { side: Side::Long, qty: fp(2.0), entry_price: fp(100.0) });
        apply_fill(&mut pos, Side::Long, fp(2.0), fp(110.0));
        let p = pos.unwrap();
        assert_eq!(p.qty, fp(4.0));
        assert!((p.entry_price.from_fp() - 105.0).abs() < 1e-8);
    }

    #[test]
    fn reducing_fill_books_realized_pnl() {
        let mut pos = Some(Position { side: Side::Long, qty: fp(2.0), entry_price: fp(100.0) });
        let realized = apply_fill(&mut pos, Side::Short, fp(1.0), fp(110.0));
        assert!((realized.from_fp() - 10.0).abs() < 1e-8);
        assert_eq!(pos.unwrap().qty, fp(1.0));
    }

    #[test]
    fn full_close_clears_position() {
        let mut pos = Some(Position { side: Side::Long, qty: fp(2.0), entry_price: fp(100.0) });
        apply_fill(&mut pos, Side::Short, fp(2.0), fp(100.0));
        assert!(pos.is_none());
    }

    #[test]
    fn overfill_flips_position_side() {
        let mut pos = Some(Position { side: Side::Long, qty: fp(2.0), entry_price: fp(100.0) });
        apply_fill(&mut pos, Side::Short, fp(3.0), fp(100.0));
        let p = pos.unwrap();
        assert_eq!(p.side, Side::Short);
        assert_eq!(p.qty, fp(1.0));
    }
}
