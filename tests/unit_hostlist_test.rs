use beryld::core::hostlist::{expand, fold};

#[test]
fn test_expand_plain_names() {
    let names = expand("alpha,beta,gamma").unwrap();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);
}

#[test]
fn test_expand_padded_ranges() {
    let names = expand("n[01-04,07,10-12]").unwrap();
    assert_eq!(
        names,
        vec!["n01", "n02", "n03", "n04", "n07", "n10", "n11", "n12"]
    );
}

#[test]
fn test_expand_mixed_items() {
    let names = expand("login,n[1-2],gpu[3]").unwrap();
    assert_eq!(names, vec!["login", "n1", "n2", "gpu3"]);
}

#[test]
fn test_expand_deduplicates_stably() {
    let names = expand("n1,n[1-3],n2").unwrap();
    assert_eq!(names, vec!["n1", "n2", "n3"]);
}

#[test]
fn test_expand_rejects_descending_range() {
    assert!(expand("n[4-1]").is_err());
}

#[test]
fn test_expand_rejects_unbalanced_brackets() {
    assert!(expand("n[1-3").is_err());
    assert!(expand("n1-3]").is_err());
}

#[test]
fn test_expand_rejects_absurd_range() {
    assert!(expand("n[1-9999999]").is_err());
}

#[test]
fn test_fold_compresses_runs() {
    let names = vec![
        "n1".to_string(),
        "n2".to_string(),
        "n3".to_string(),
        "n7".to_string(),
    ];
    assert_eq!(fold(&names), "n[1-3],n7");
}

#[test]
fn test_fold_keeps_padding() {
    let names = vec!["n01".to_string(), "n02".to_string(), "n03".to_string()];
    let folded = fold(&names);
    assert_eq!(folded, "n[01-03]");
    assert_eq!(expand(&folded).unwrap(), names);
}

#[test]
fn test_fold_handles_non_numeric_names() {
    let names = vec!["login".to_string(), "n1".to_string(), "n2".to_string()];
    assert_eq!(fold(&names), "login,n[1-2]");
}

#[test]
fn test_fold_single_host_stays_plain() {
    assert_eq!(fold(&["n5".to_string()]), "n5");
}

#[test]
fn test_expand_fold_round_trip() {
    let expr = "rack[1-4],gpu[01-02],login";
    let names = expand(expr).unwrap();
    assert_eq!(expand(&fold(&names)).unwrap(), names);
}
