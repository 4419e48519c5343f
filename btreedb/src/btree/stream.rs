use std::collections::VecDeque;

use futures::stream;
use futures::Stream;
use futures::StreamExt;

use super::node::Record;
use super::store::BTreeDb;
use super::store::Direction;

impl BTreeDb {
    /// Return a stream of entries.
    pub async fn entries(
        &self,
        direction: Direction,
    ) -> impl Stream<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.entries_range(direction, None, None).await
    }

    /// Return a stream of entries bounded to a key range. Ascending
    /// streams cover `start <= key < stop`, descending streams cover
    /// `stop < key <= start`; `None` leaves that side unbounded.
    pub async fn entries_range(
        &self,
        direction: Direction,
        start: Option<Vec<u8>>,
        stop: Option<Vec<u8>>,
    ) -> impl Stream<Item = (Vec<u8>, Vec<u8>)> + '_ {
        let batch = self.initial_batch(direction, start.as_deref()).await;

        // Each batch is one logical leaf; when it drains, the leaf right
        // of (or left of) the last emitted key supplies the next one.
        Box::pin(stream::unfold(
            (batch, None::<Vec<u8>>, stop),
            move |(mut batch, mut cursor, stop)| async move {
                loop {
                    if let Some(record) = batch.pop_front() {
                        let keep = match direction {
                            Direction::Ascending => stop
                                .as_ref()
                                .map_or(true, |upper| record.key < *upper),
                            Direction::Descending => stop
                                .as_ref()
                                .map_or(true, |lower| record.key > *lower),
                        };
                        if !keep {
                            break None;
                        }
                        cursor = Some(record.key.clone());
                        break Some(((record.key, record.value), (batch, cursor, stop)));
                    }

                    let Some(last) = cursor.take() else {
                        break None;
                    };
                    let inner = self.read_inner().await;
                    let refill = match direction {
                        Direction::Ascending => inner.leaf_records_from(&last, false),
                        Direction::Descending => inner.leaf_records_until(&last, false),
                    };
                    match refill {
                        Ok(records) if records.is_empty() => break None,
                        Ok(records) => {
                            batch = order_batch(records, direction);
                            cursor = Some(last);
                        }
                        Err(e) => {
                            tracing::error!("entry stream lost its leaf: {e}");
                            break None;
                        }
                    }
                }
            },
        ))
    }

    /// Return a stream of keys.
    pub async fn keys(&self, direction: Direction) -> impl Stream<Item = Vec<u8>> + '_ {
        self.entries(direction).await.map(|(key, _)| key)
    }

    /// Return a stream of values.
    pub async fn values(&self, direction: Direction) -> impl Stream<Item = Vec<u8>> + '_ {
        self.entries(direction).await.map(|(_, value)| value)
    }

    async fn initial_batch(
        &self,
        direction: Direction,
        start: Option<&[u8]>,
    ) -> VecDeque<Record> {
        let inner = self.read_inner().await;
        let records = match (direction, start) {
            (Direction::Ascending, Some(start)) => inner.leaf_records_from(start, true),
            (Direction::Ascending, None) => inner.first_leaf_records(),
            (Direction::Descending, Some(start)) => inner.leaf_records_until(start, true),
            (Direction::Descending, None) => inner.last_leaf_records(),
        };
        match records {
            Ok(records) => order_batch(records, direction),
            Err(e) => {
                tracing::error!("entry stream could not seed itself: {e}");
                VecDeque::new()
            }
        }
    }
}

fn order_batch(records: Vec<Record>, direction: Direction) -> VecDeque<Record> {
    let mut batch: VecDeque<Record> = records.into();
    if direction == Direction::Descending {
        batch.make_contiguous().reverse();
    }
    batch
}
