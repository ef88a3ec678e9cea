//! Top-of-Book Aggregation
//!
//! Reconstructs the best bid and best offer for one symbol from an unordered
//! stream of per-participant book quote upserts and deletes.
//!
//! # Design
//!
//! Each side keeps its resting quotes in a `Vec` ordered from worst to best,
//! so the most competitive quote always sits at the tail. Competitiveness is:
//!
//! 1. Price (higher is better for bids, lower is better for asks)
//! 2. Size (larger is better)
//! 3. Timestamp (earlier is better)
//! 4. Participant id (lexicographically smaller is better)
//!
//! With that order the BBO of a side is simply its last element, which makes
//! recomputation after every mutation constant time.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::market_data::{BboQuote, BookQuote, Quote, Side};

// =============================================================================
// Ordering
// =============================================================================

/// Compare two prices on a side. `Less` means `a` is the worse price.
fn compare_price(side: Side, a: Decimal, b: Decimal) -> Ordering {
    match side {
        Side::Bid => a.cmp(&b),
        Side::Ask => b.cmp(&a),
    }
}

/// Compare two resting quotes on a side. `Less` means `a` is less competitive.
fn compare_quotes(side: Side, a: &BookQuote, b: &BookQuote) -> Ordering {
    compare_price(side, a.quote.price, b.quote.price)
        .then_with(|| a.quote.size.cmp(&b.quote.size))
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| b.participant_id.cmp(&a.participant_id))
}

// =============================================================================
// Aggregator
// =============================================================================

/// Incremental best bid/offer model for a single symbol.
///
/// # Example
///
/// ```rust
/// use chrono::Utc;
/// use rust_decimal::Decimal;
/// use feed_multiplexer::domain::market_data::{BookQuote, Quote, Side, Venue};
/// use feed_multiplexer::domain::top_of_book::TopOfBookAggregator;
///
/// let mut aggregator = TopOfBookAggregator::new();
/// let quote = BookQuote::new(
///     "M1",
///     true,
///     Venue::new("ASTR"),
///     Quote::new(Decimal::from(10), Decimal::from(100), Side::Bid),
///     Utc::now(),
/// );
///
/// assert!(aggregator.update(&quote));
/// assert_eq!(aggregator.bbo().bid.size, Decimal::from(100));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TopOfBookAggregator {
    bids: Vec<BookQuote>,
    asks: Vec<BookQuote>,
    bbo: BboQuote,
}

impl TopOfBookAggregator {
    /// Create an aggregator with an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The last computed best bid and offer.
    #[must_use]
    pub const fn bbo(&self) -> &BboQuote {
        &self.bbo
    }

    /// Number of resting quotes on a side.
    #[must_use]
    pub fn depth(&self, side: Side) -> usize {
        self.book(side).len()
    }

    /// Whether both sides are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Resting quotes on a side, most competitive first.
    pub fn quotes(&self, side: Side) -> impl Iterator<Item = &BookQuote> {
        self.book(side).iter().rev()
    }

    /// Apply one book quote update.
    ///
    /// A size of zero deletes the participant's quote at that price; any
    /// other size inserts or replaces it. Returns `true` iff the price or
    /// size of the best bid or best ask changed.
    pub fn update(&mut self, quote: &BookQuote) -> bool {
        debug_assert!(
            quote.quote.size >= Decimal::ZERO,
            "book quote size must not be negative"
        );

        let side = quote.quote.side;
        let book = self.book_mut(side);
        let price = quote.quote.price;

        let start =
            book.partition_point(|entry| compare_price(side, entry.quote.price, price).is_lt());
        let run = book[start..]
            .partition_point(|entry| compare_price(side, entry.quote.price, price).is_eq());
        let existing = book[start..start + run]
            .iter()
            .position(|entry| entry.participant_id == quote.participant_id)
            .map(|offset| start + offset);

        match (existing, quote.is_delete()) {
            (None, true) => return false,
            (Some(index), true) => {
                book.remove(index);
            }
            (Some(index), false) => reposition(book, index, quote),
            (None, false) => {
                let position = book
                    .partition_point(|entry| compare_quotes(side, entry, quote).is_lt());
                book.insert(position, quote.clone());
            }
        }

        self.refresh(side, quote.timestamp)
    }

    /// Remove every resting quote and reset the BBO.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.bbo = BboQuote::empty();
    }

    /// Recompute the best quote of a side, returning whether it changed.
    fn refresh(&mut self, side: Side, timestamp: DateTime<Utc>) -> bool {
        let best = self.book(side).last().map_or_else(
            || Quote::empty(side),
            |entry| Quote::new(entry.quote.price, entry.quote.size, side),
        );

        let current = match side {
            Side::Bid => &mut self.bbo.bid,
            Side::Ask => &mut self.bbo.ask,
        };

        if current.price == best.price && current.size == best.size {
            return false;
        }

        *current = best;
        self.bbo.timestamp = timestamp;
        true
    }

    const fn book(&self, side: Side) -> &Vec<BookQuote> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    const fn book_mut(&mut self, side: Side) -> &mut Vec<BookQuote> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }
}

/// Replace an existing entry, moving it only if its sort position changed.
fn reposition(book: &mut Vec<BookQuote>, index: usize, quote: &BookQuote) {
    let side = quote.quote.side;
    let fits_below = index == 0 || compare_quotes(side, &book[index - 1], quote).is_le();
    let fits_above =
        index + 1 == book.len() || compare_quotes(side, quote, &book[index + 1]).is_le();

    if fits_below && fits_above {
        book[index] = quote.clone();
        return;
    }

    book.remove(index);
    let position = book.partition_point(|entry| compare_quotes(side, entry, quote).is_lt());
    book.insert(position, quote.clone());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::domain::market_data::Venue;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_736_935_200 + seconds, 0).unwrap()
    }

    fn book_quote(side: Side, price: i64, size: i64, mpid: &str, timestamp: DateTime<Utc>) -> BookQuote {
        BookQuote::new(
            mpid,
            false,
            Venue::default(),
            Quote::new(Decimal::from(price), Decimal::from(size), side),
            timestamp,
        )
    }

    #[test]
    fn default_bbo_is_empty() {
        let aggregator = TopOfBookAggregator::new();
        let bbo = aggregator.bbo();

        assert_eq!(bbo.bid.price, Decimal::ZERO);
        assert_eq!(bbo.bid.size, Decimal::ZERO);
        assert_eq!(bbo.bid.side, Side::Bid);
        assert_eq!(bbo.ask.price, Decimal::ZERO);
        assert_eq!(bbo.ask.size, Decimal::ZERO);
        assert_eq!(bbo.ask.side, Side::Ask);
    }

    #[test]
    fn single_bid_update() {
        let mut aggregator = TopOfBookAggregator::new();

        let changed = aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));

        assert!(changed);
        assert_eq!(aggregator.bbo().bid.price, Decimal::from(10));
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(100));
        assert_eq!(aggregator.bbo().timestamp, at(0));
    }

    #[test]
    fn single_ask_update() {
        let mut aggregator = TopOfBookAggregator::new();

        let changed = aggregator.update(&book_quote(Side::Ask, 11, 200, "MPID1", at(0)));

        assert!(changed);
        assert_eq!(aggregator.bbo().ask.price, Decimal::from(11));
        assert_eq!(aggregator.bbo().ask.size, Decimal::from(200));
        assert_eq!(aggregator.bbo().timestamp, at(0));
    }

    #[test]
    fn best_bid_by_price() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Bid, 11, 50, "MPID2", at(0)));

        assert_eq!(aggregator.bbo().bid.price, Decimal::from(11));
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(50));
    }

    #[test]
    fn best_ask_by_price() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Ask, 12, 100, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Ask, 11, 50, "MPID2", at(0)));

        assert_eq!(aggregator.bbo().ask.price, Decimal::from(11));
        assert_eq!(aggregator.bbo().ask.size, Decimal::from(50));
    }

    #[test]
    fn larger_size_wins_at_same_price() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Bid, 10, 200, "MPID2", at(0)));

        assert_eq!(aggregator.bbo().bid.price, Decimal::from(10));
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(200));
    }

    #[test]
    fn earlier_timestamp_wins_at_same_price_and_size() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "LATE", at(5)));
        aggregator.update(&book_quote(Side::Bid, 10, 100, "EARLY", at(1)));

        let best = aggregator.quotes(Side::Bid).next().unwrap();
        assert_eq!(best.participant_id, "EARLY");
    }

    #[test]
    fn replace_existing_quote() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 10, 150, "MPID1", at(1)));

        assert!(changed);
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(150));
        assert_eq!(aggregator.bbo().timestamp, at(1));
        assert_eq!(aggregator.depth(Side::Bid), 1);
    }

    #[test]
    fn delete_quote_falls_back_to_next_level() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Bid, 9, 50, "MPID2", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 10, 0, "MPID1", at(0)));

        assert!(changed);
        assert_eq!(aggregator.bbo().bid.price, Decimal::from(9));
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(50));
    }

    #[test]
    fn delete_nonexistent_quote_is_noop() {
        let mut aggregator = TopOfBookAggregator::new();
        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));

        let changed = aggregator.update(&book_quote(Side::Bid, 10, 0, "MPID2", at(3)));

        assert!(!changed);
        assert_eq!(aggregator.depth(Side::Bid), 1);
        assert_eq!(aggregator.bbo().timestamp, at(0));
    }

    #[test]
    fn delete_at_wrong_price_is_noop() {
        let mut aggregator = TopOfBookAggregator::new();
        aggregator.update(&book_quote(Side::Ask, 10, 100, "MPID1", at(0)));

        let changed = aggregator.update(&book_quote(Side::Ask, 11, 0, "MPID1", at(0)));

        assert!(!changed);
        assert_eq!(aggregator.depth(Side::Ask), 1);
    }

    #[test]
    fn delete_last_quote_empties_side() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 10, 0, "MPID1", at(0)));

        assert!(changed);
        assert_eq!(aggregator.bbo().bid.price, Decimal::ZERO);
        assert_eq!(aggregator.bbo().bid.size, Decimal::ZERO);
        assert!(aggregator.is_empty());
    }

    #[test]
    fn no_change_when_not_at_best_price() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 8, 50, "MPID2", at(0)));

        assert!(!changed);
        assert_eq!(aggregator.bbo().bid.price, Decimal::from(10));
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(100));
    }

    #[test]
    fn smaller_size_at_best_price_does_not_change_bbo() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 200, "MPID1", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID2", at(0)));

        assert!(!changed);
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(200));
    }

    #[test]
    fn bid_and_ask_independent() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Ask, 11, 200, "MPID2", at(0)));

        let bbo = aggregator.bbo();
        assert_eq!(bbo.bid.price, Decimal::from(10));
        assert_eq!(bbo.bid.size, Decimal::from(100));
        assert_eq!(bbo.ask.price, Decimal::from(11));
        assert_eq!(bbo.ask.size, Decimal::from(200));
    }

    #[test]
    fn delete_at_non_best_price() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Bid, 8, 50, "MPID2", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 8, 0, "MPID2", at(0)));

        assert!(!changed);
        assert_eq!(aggregator.bbo().bid.price, Decimal::from(10));
        assert_eq!(aggregator.depth(Side::Bid), 1);
    }

    #[test]
    fn replace_best_with_smaller_size() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 200, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Bid, 10, 150, "MPID2", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 10, 50, "MPID1", at(0)));

        assert!(changed);
        assert_eq!(aggregator.bbo().bid.price, Decimal::from(10));
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(150));
    }

    #[test]
    fn new_better_ask_replaces_bbo() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Ask, 12, 100, "MPID1", at(0)));
        let changed = aggregator.update(&book_quote(Side::Ask, 11, 50, "MPID2", at(0)));

        assert!(changed);
        assert_eq!(aggregator.bbo().ask.price, Decimal::from(11));
        assert_eq!(aggregator.bbo().ask.size, Decimal::from(50));
    }

    #[test]
    fn multiple_participants_delete_best_size() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 300, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Bid, 10, 200, "MPID2", at(0)));
        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID3", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 10, 0, "MPID1", at(0)));

        assert!(changed);
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(200));
    }

    #[test]
    fn replace_non_best_size_no_bbo_change() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Bid, 10, 200, "MPID1", at(0)));
        aggregator.update(&book_quote(Side::Bid, 10, 50, "MPID2", at(0)));
        let changed = aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID2", at(1)));

        assert!(!changed);
        assert_eq!(aggregator.bbo().bid.size, Decimal::from(200));
        assert_eq!(aggregator.bbo().timestamp, at(0));
    }

    #[test]
    fn same_participant_can_rest_at_several_prices() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Ask, 11, 10, "ASTR", at(0)));
        aggregator.update(&book_quote(Side::Ask, 12, 20, "ASTR", at(0)));
        aggregator.update(&book_quote(Side::Ask, 11, 0, "ASTR", at(1)));

        assert_eq!(aggregator.depth(Side::Ask), 1);
        assert_eq!(aggregator.bbo().ask.price, Decimal::from(12));
        assert_eq!(aggregator.bbo().ask.size, Decimal::from(20));
    }

    #[test]
    fn quotes_are_ordered_best_first() {
        let mut aggregator = TopOfBookAggregator::new();

        aggregator.update(&book_quote(Side::Ask, 12, 10, "A", at(0)));
        aggregator.update(&book_quote(Side::Ask, 11, 5, "B", at(0)));
        aggregator.update(&book_quote(Side::Ask, 11, 7, "C", at(0)));

        let order: Vec<_> = aggregator
            .quotes(Side::Ask)
            .map(|q| q.participant_id.as_str())
            .collect();
        assert_eq!(order, vec!["C", "B", "A"]);
    }

    #[test]
    fn clear_resets_book() {
        let mut aggregator = TopOfBookAggregator::new();
        aggregator.update(&book_quote(Side::Bid, 10, 100, "MPID1", at(0)));

        aggregator.clear();

        assert!(aggregator.is_empty());
        assert_eq!(*aggregator.bbo(), BboQuote::empty());
    }

    // =========================================================================
    // Reference model
    // =========================================================================

    /// Straightforward "store everything, sort and pick" model.
    #[derive(Default)]
    struct ReferenceBook {
        entries: HashMap<(Side, String, Decimal), Decimal>,
    }

    impl ReferenceBook {
        fn apply(&mut self, quote: &BookQuote) {
            let key = (
                quote.quote.side,
                quote.participant_id.clone(),
                quote.quote.price,
            );
            if quote.is_delete() {
                self.entries.remove(&key);
            } else {
                self.entries.insert(key, quote.quote.size);
            }
        }

        fn best(&self, side: Side) -> (Decimal, Decimal) {
            let mut levels: Vec<(Decimal, Decimal)> = self
                .entries
                .iter()
                .filter(|((s, _, _), _)| *s == side)
                .map(|((_, _, price), size)| (*price, *size))
                .collect();
            levels.sort_by(|a, b| {
                compare_price(side, a.0, b.0).then_with(|| a.1.cmp(&b.1))
            });
            levels
                .last()
                .copied()
                .unwrap_or((Decimal::ZERO, Decimal::ZERO))
        }
    }

    fn arb_update() -> impl Strategy<Value = BookQuote> {
        (
            prop_oneof![Just(Side::Bid), Just(Side::Ask)],
            1i64..6,
            0i64..4,
            0usize..4,
            0i64..10,
        )
            .prop_map(|(side, price, size, participant, seconds)| {
                book_quote(side, price, size, &format!("MPID{participant}"), at(seconds))
            })
    }

    proptest! {
        #[test]
        fn incremental_bbo_matches_reference(updates in prop::collection::vec(arb_update(), 1..200)) {
            let mut aggregator = TopOfBookAggregator::new();
            let mut reference = ReferenceBook::default();

            for update in &updates {
                let before = *aggregator.bbo();
                let changed = aggregator.update(update);
                reference.apply(update);

                let after = aggregator.bbo();
                for side in [Side::Bid, Side::Ask] {
                    let (price, size) = reference.best(side);
                    prop_assert_eq!(after.side(side).price, price);
                    prop_assert_eq!(after.side(side).size, size);
                }

                let observable_change = before.bid.price != after.bid.price
                    || before.bid.size != after.bid.size
                    || before.ask.price != after.ask.price
                    || before.ask.size != after.ask.size;
                prop_assert_eq!(changed, observable_change);
            }
        }
    }
}
