use rand::Rng;
use rand::seq::index;

/// Picks which of `total` pages (1-based) are carried into validation.
/// Every page is kept when the document fits in `max_samples`; otherwise a
/// random subset of exactly `max_samples` pages is returned in ascending
/// order.
pub fn sample_pages<R: Rng + ?Sized>(total: usize, max_samples: usize, rng: &mut R) -> Vec<u32> {
    if total <= max_samples {
        return (1..=total as u32).collect();
    }

    let mut picked = index::sample(rng, total, max_samples)
        .into_iter()
        .map(|position| position as u32 + 1)
        .collect::<Vec<u32>>();
    picked.sort_unstable();
    picked
}

/// Same policy over an explicit list of page numbers, for tools whose page
/// numbering has gaps.
pub fn sample_page_numbers<R: Rng + ?Sized>(
    available: &[u32],
    max_samples: usize,
    rng: &mut R,
) -> Vec<u32> {
    sample_pages(available.len(), max_samples, rng)
        .into_iter()
        .map(|position| available[position as usize - 1])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn sample_size_is_min_of_total_and_max() {
        let mut rng = StdRng::seed_from_u64(7);
        for total in 0..40 {
            for max in 0..12 {
                let sample = sample_pages(total, max, &mut rng);
                assert_eq!(sample.len(), total.min(max), "total={total} max={max}");
                assert!(sample.windows(2).all(|pair| pair[0] < pair[1]));
                assert!(sample.iter().all(|page| *page >= 1 && *page as usize <= total));
            }
        }
    }

    #[test]
    fn small_documents_keep_every_page_in_order() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample_pages(3, 5, &mut rng), vec![1, 2, 3]);
        assert_eq!(sample_pages(5, 5, &mut rng), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn same_seed_gives_same_sample() {
        let first = sample_pages(100, 5, &mut StdRng::seed_from_u64(42));
        let second = sample_pages(100, 5, &mut StdRng::seed_from_u64(42));
        assert_eq!(first, second);
    }

    #[test]
    fn explicit_page_numbers_are_mapped_through() {
        let mut rng = StdRng::seed_from_u64(3);
        let available = [2, 4, 9];
        assert_eq!(sample_page_numbers(&available, 5, &mut rng), vec![2, 4, 9]);

        let sample = sample_page_numbers(&[10, 20, 30, 40, 50, 60], 2, &mut rng);
        assert_eq!(sample.len(), 2);
        assert!(sample.iter().all(|page| [10, 20, 30, 40, 50, 60].contains(page)));
    }
}
