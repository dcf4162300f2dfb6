use beryld::core::bitmap::Bitmap;

#[test]
fn test_set_test_clear() {
    let mut bm = Bitmap::with_size(130);
    assert!(!bm.test(0));
    bm.set(0);
    bm.set(64);
    bm.set(129);
    assert!(bm.test(0));
    assert!(bm.test(64));
    assert!(bm.test(129));
    assert_eq!(bm.count(), 3);
    bm.clear(64);
    assert!(!bm.test(64));
    assert_eq!(bm.count(), 2);
}

#[test]
fn test_out_of_range_reads_are_false() {
    let bm = Bitmap::with_size(10);
    assert!(!bm.test(1000));
}

#[test]
fn test_first_set_and_iter() {
    let mut bm = Bitmap::with_size(100);
    assert_eq!(bm.first_set(), None);
    bm.set(7);
    bm.set(70);
    assert_eq!(bm.first_set(), Some(7));
    let set: Vec<usize> = bm.iter_set().collect();
    assert_eq!(set, vec![7, 70]);
}

#[test]
fn test_set_all_respects_width() {
    let mut bm = Bitmap::with_size(66);
    bm.set_all();
    assert_eq!(bm.count(), 66);
}

#[test]
fn test_boolean_operations() {
    let mut a = Bitmap::with_size(8);
    let mut b = Bitmap::with_size(8);
    a.set(1);
    a.set(2);
    b.set(2);
    b.set(3);

    let mut and = a.clone();
    and.and(&b);
    assert_eq!(and.iter_set().collect::<Vec<_>>(), vec![2]);

    let mut or = a.clone();
    or.or(&b);
    assert_eq!(or.iter_set().collect::<Vec<_>>(), vec![1, 2, 3]);

    let mut diff = a.clone();
    diff.and_not(&b);
    assert_eq!(diff.iter_set().collect::<Vec<_>>(), vec![1]);
}

#[test]
fn test_subset_and_overlap() {
    let mut small = Bitmap::with_size(8);
    let mut big = Bitmap::with_size(8);
    small.set(1);
    big.set(1);
    big.set(2);
    assert!(small.is_subset_of(&big));
    assert!(!big.is_subset_of(&small));
    assert!(small.overlaps(&big));

    let empty = Bitmap::with_size(8);
    assert!(empty.is_subset_of(&small));
    assert!(!empty.overlaps(&small));
}

#[test]
fn test_resize_preserves_surviving_bits() {
    let mut bm = Bitmap::with_size(100);
    bm.set(3);
    bm.set(90);
    bm.resize(10);
    assert!(bm.test(3));
    assert_eq!(bm.count(), 1);
    bm.resize(200);
    assert!(bm.test(3));
    assert!(!bm.test(90));
}

#[test]
fn test_words_round_trip() {
    let mut bm = Bitmap::with_size(70);
    bm.set(0);
    bm.set(69);
    let rebuilt = Bitmap::from_words(70, bm.words().to_vec()).unwrap();
    assert_eq!(rebuilt, bm);
}

#[test]
fn test_from_words_rejects_bad_length() {
    assert!(Bitmap::from_words(70, vec![0]).is_err());
}
