//! Batching of bins into transport-sized loads.

use crate::error::Result;

use super::Bin;

/// Packs bins into batches of at most `max_load_splats` total splats and
/// forwards each batch to a sink (the scatter channel on the root rank).
///
/// Batches never span chunk boundaries, so a worker's fragments for one
/// batch all land in the same output chunk.
pub struct BucketCollector<F> {
    max_load_splats: u64,
    batch: Vec<Bin>,
    batch_splats: u64,
    sink: F,
}

impl<F> BucketCollector<F>
where
    F: FnMut(Vec<Bin>) -> Result<()>,
{
    pub fn new(max_load_splats: u64, sink: F) -> Self {
        assert!(max_load_splats > 0);
        BucketCollector {
            max_load_splats,
            batch: Vec::new(),
            batch_splats: 0,
            sink,
        }
    }

    /// Add one bin, flushing first if it would overflow the load limit or
    /// cross a chunk boundary.
    pub fn add(&mut self, bin: Bin) -> Result<()> {
        if !self.batch.is_empty() {
            let overflow = self.batch_splats + bin.num_splats > self.max_load_splats;
            let chunk_change = self.batch[0].chunk != bin.chunk;
            if overflow || chunk_change {
                self.flush()?;
            }
        }
        self.batch_splats += bin.num_splats;
        self.batch.push(bin);
        Ok(())
    }

    /// Send any pending batch downstream.
    pub fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.batch_splats = 0;
        (self.sink)(std::mem::take(&mut self.batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::ChunkId;
    use crate::grid::Grid;

    fn bin(splats: u64, chunk: ChunkId) -> Bin {
        Bin {
            ranges: vec![(0, splats)],
            num_splats: splats,
            grid: Grid::new([0.0; 3], 1.0, [(0, 4); 3]),
            chunk,
        }
    }

    #[test]
    fn batches_by_load() {
        let mut batches = Vec::new();
        {
            let mut collector = BucketCollector::new(100, |bins| {
                batches.push(bins.iter().map(|b| b.num_splats).collect::<Vec<_>>());
                Ok(())
            });
            for _ in 0..5 {
                collector.add(bin(40, ChunkId::default())).unwrap();
            }
            collector.flush().unwrap();
        }
        assert_eq!(batches, vec![vec![40, 40], vec![40, 40], vec![40]]);
    }

    #[test]
    fn chunk_boundary_forces_flush() {
        let mut batches = Vec::new();
        {
            let mut collector = BucketCollector::new(1000, |bins| {
                batches.push(bins.iter().map(|b| b.chunk).collect::<Vec<_>>());
                Ok(())
            });
            let a = ChunkId {
                gen: 0,
                coords: [0, 0, 0],
            };
            let b = ChunkId {
                gen: 0,
                coords: [1, 0, 0],
            };
            collector.add(bin(10, a)).unwrap();
            collector.add(bin(10, a)).unwrap();
            collector.add(bin(10, b)).unwrap();
            collector.flush().unwrap();
        }
        assert_eq!(batches.len(), 2);
        assert!(batches[0].iter().all(|&c| c.coords == [0, 0, 0]));
        assert!(batches[1].iter().all(|&c| c.coords == [1, 0, 0]));
    }

    #[test]
    fn flush_when_empty_is_a_no_op() {
        let mut calls = 0;
        {
            let mut collector = BucketCollector::new(10, |_| {
                calls += 1;
                Ok(())
            });
            collector.flush().unwrap();
            collector.add(bin(5, ChunkId::default())).unwrap();
            collector.flush().unwrap();
            collector.flush().unwrap();
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn oversized_bin_flushes_then_travels_alone() {
        let mut batches = Vec::new();
        {
            let mut collector = BucketCollector::new(50, |bins| {
                batches.push(bins.iter().map(|b| b.num_splats).collect::<Vec<_>>());
                Ok(())
            });
            collector.add(bin(30, ChunkId::default())).unwrap();
            collector.add(bin(80, ChunkId::default())).unwrap();
            collector.flush().unwrap();
        }
        assert_eq!(batches, vec![vec![30], vec![80]]);
    }
}
