use std::fs;

use anyhow::Result;
use maplit::btreemap;
use ocflkit::{OcflError, VersionInfo, VersionNum, VersionRef};
use tempfile::TempDir;

mod common;

use common::{init_repo, read_tree, repo_root, write_tree};

#[test]
fn staged_revisions_seal_into_a_single_version() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let x = temp.path().join("x.txt");
    let y = temp.path().join("y.txt");
    fs::write(&x, "1")?;
    fs::write(&y, "2")?;

    repo.stage_changes("o2", VersionInfo::new(), |updater| {
        updater.add_file(&x, "x.txt", false)
    })?;

    assert!(repo.has_staged_changes("o2")?);

    repo.stage_changes("o2", VersionInfo::new(), |updater| {
        updater.add_file(&y, "y.txt", false)
    })?;

    repo.commit_staged_changes("o2", VersionInfo::new())?;

    let details = repo.describe_object("o2")?;
    assert_eq!(VersionNum::new(1), details.version_details.version_num);
    assert!(!details.has_staged_changes);
    assert!(!repo.has_staged_changes("o2")?);

    let object_root = repo_root(&temp).join(&details.object_root);
    assert!(!object_root.join("extensions/0005-mutable-head").exists());
    assert!(object_root.join("v1/content/x.txt").is_file());
    assert!(object_root.join("v1/content/y.txt").is_file());

    let out = temp.path().join("out");
    repo.get_object("o2", VersionRef::Head, &out)?;
    assert_eq!(
        btreemap! {
            "x.txt".to_string() => "1".to_string(),
            "y.txt".to_string() => "2".to_string(),
        },
        read_tree(&out)?
    );

    Ok(())
}

#[test]
fn staged_changes_are_readable_before_the_commit() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let x = temp.path().join("x.txt");
    fs::write(&x, "staged")?;

    repo.stage_changes("o1", VersionInfo::new(), |updater| {
        updater.add_file(&x, "x.txt", false)
    })?;

    let out = temp.path().join("out");
    repo.get_object("o1", VersionRef::Head, &out)?;
    assert_eq!("staged", read_tree(&out)?["x.txt"]);

    // The content physically lives inside the extension directory
    let object_root = repo_root(&temp).join(&repo.describe_object("o1")?.object_root);
    assert!(object_root
        .join("extensions/0005-mutable-head/head/content/r1/x.txt")
        .is_file());
    assert!(object_root
        .join("extensions/0005-mutable-head/head/revisions/r1")
        .is_file());

    Ok(())
}

#[test]
fn staging_on_an_existing_object_advances_the_head() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let src = temp.path().join("src");
    write_tree(&src, &[("a.txt", "base\n")])?;
    repo.put_object("o1", &src, VersionInfo::new())?;

    let b = temp.path().join("b.txt");
    fs::write(&b, "staged\n")?;

    repo.stage_changes("o1", VersionInfo::new(), |updater| {
        updater.add_file(&b, "b.txt", false)
    })?;

    assert_eq!(
        VersionNum::new(2),
        repo.describe_object("o1")?.version_details.version_num
    );

    repo.commit_staged_changes("o1", VersionInfo::new())?;

    let details = repo.describe_object("o1")?;
    assert_eq!(VersionNum::new(2), details.version_details.version_num);

    let out = temp.path().join("out");
    repo.get_object("o1", VersionRef::Head, &out)?;
    assert_eq!(
        btreemap! {
            "a.txt".to_string() => "base\n".to_string(),
            "b.txt".to_string() => "staged\n".to_string(),
        },
        read_tree(&out)?
    );

    // Only the newly staged file lands in v2
    let v2_content = repo_root(&temp)
        .join(&details.object_root)
        .join("v2/content");
    assert_eq!(1, read_tree(&v2_content)?.len());

    Ok(())
}

#[test]
fn committing_without_staged_changes_is_a_noop() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let src = temp.path().join("src");
    write_tree(&src, &[("a.txt", "base\n")])?;
    repo.put_object("o1", &src, VersionInfo::new())?;

    repo.commit_staged_changes("o1", VersionInfo::new())?;

    assert_eq!(
        VersionNum::new(1),
        repo.describe_object("o1")?.version_details.version_num
    );

    Ok(())
}

#[test]
fn purging_staged_changes_restores_the_base_version() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let src = temp.path().join("src");
    write_tree(&src, &[("a.txt", "base\n")])?;
    repo.put_object("o1", &src, VersionInfo::new())?;

    let b = temp.path().join("b.txt");
    fs::write(&b, "staged\n")?;
    repo.stage_changes("o1", VersionInfo::new(), |updater| {
        updater.add_file(&b, "b.txt", false)
    })?;

    repo.purge_staged_changes("o1")?;

    assert!(!repo.has_staged_changes("o1")?);
    assert_eq!(
        VersionNum::new(1),
        repo.describe_object("o1")?.version_details.version_num
    );

    let object_root = repo_root(&temp).join(&repo.describe_object("o1")?.object_root);
    assert!(!object_root.join("extensions/0005-mutable-head").exists());

    Ok(())
}

#[test]
fn purging_staged_changes_of_an_uncommitted_object_removes_it() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let x = temp.path().join("x.txt");
    fs::write(&x, "staged")?;
    repo.stage_changes("o1", VersionInfo::new(), |updater| {
        updater.add_file(&x, "x.txt", false)
    })?;

    repo.purge_staged_changes("o1")?;

    assert!(!repo.contains_object("o1")?);

    Ok(())
}

#[test]
fn sealing_is_equivalent_to_a_single_update() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let src = temp.path().join("src");
    write_tree(&src, &[("a.txt", "base\n")])?;

    let x = temp.path().join("x.txt");
    let y = temp.path().join("y.txt");
    fs::write(&x, "ex\n")?;
    fs::write(&y, "why\n")?;

    // Object one: two staged revisions, the second of which undoes part of the first
    repo.put_object("staged", &src, VersionInfo::new())?;
    repo.stage_changes("staged", VersionInfo::new(), |updater| {
        updater.add_file(&x, "x.txt", false)
    })?;
    repo.stage_changes("staged", VersionInfo::new(), |updater| {
        updater.add_file(&y, "y.txt", false)?;
        updater.remove_file("x.txt")
    })?;
    repo.commit_staged_changes("staged", VersionInfo::new())?;

    // Object two: the same net change applied as one immutable update
    repo.put_object("direct", &src, VersionInfo::new())?;
    repo.update_object("direct", VersionInfo::new(), |updater| {
        updater.add_file(&y, "y.txt", false)
    })?;

    let staged_out = temp.path().join("staged-out");
    let direct_out = temp.path().join("direct-out");
    repo.get_object("staged", VersionRef::Head, &staged_out)?;
    repo.get_object("direct", VersionRef::Head, &direct_out)?;

    assert_eq!(read_tree(&direct_out)?, read_tree(&staged_out)?);
    assert_eq!(
        repo.describe_object("direct")?.version_details.version_num,
        repo.describe_object("staged")?.version_details.version_num
    );

    // The undone file's content must not survive the seal
    let staged_v2_content = repo_root(&temp)
        .join(&repo.describe_object("staged")?.object_root)
        .join("v2/content");
    assert_eq!(1, read_tree(&staged_v2_content)?.len());

    Ok(())
}

#[test]
fn detects_base_version_changing_beneath_the_mutable_head() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let src = temp.path().join("src");
    write_tree(&src, &[("a.txt", "base\n")])?;
    repo.put_object("o1", &src, VersionInfo::new())?;

    let b = temp.path().join("b.txt");
    fs::write(&b, "staged\n")?;
    repo.stage_changes("o1", VersionInfo::new(), |updater| {
        updater.add_file(&b, "b.txt", false)
    })?;

    // Simulate another writer replacing the base version
    let object_root = repo_root(&temp).join(&repo.describe_object("o1")?.object_root);
    fs::write(
        object_root.join("inventory.json.sha512"),
        "deadbeef\tinventory.json\n",
    )?;

    let c = temp.path().join("c.txt");
    fs::write(&c, "more\n")?;
    let err = repo
        .stage_changes("o1", VersionInfo::new(), |updater| {
            updater.add_file(&c, "c.txt", false)
        })
        .unwrap_err();
    assert!(matches!(err, OcflError::ObjectOutOfSync { .. }), "got: {}", err);

    let err = repo
        .commit_staged_changes("o1", VersionInfo::new())
        .unwrap_err();
    assert!(matches!(err, OcflError::ObjectOutOfSync { .. }), "got: {}", err);

    Ok(())
}

#[test]
fn immutable_writes_are_rejected_while_a_mutable_head_is_active() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let src = temp.path().join("src");
    write_tree(&src, &[("a.txt", "base\n")])?;
    repo.put_object("o1", &src, VersionInfo::new())?;

    let b = temp.path().join("b.txt");
    fs::write(&b, "staged\n")?;
    repo.stage_changes("o1", VersionInfo::new(), |updater| {
        updater.add_file(&b, "b.txt", false)
    })?;

    let err = repo.put_object("o1", &src, VersionInfo::new()).unwrap_err();
    assert!(matches!(err, OcflError::IllegalState(_)), "got: {}", err);

    let err = repo
        .update_object("o1", VersionInfo::new(), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, OcflError::IllegalState(_)), "got: {}", err);

    Ok(())
}

#[test]
fn has_staged_changes_fails_for_missing_objects() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let err = repo.has_staged_changes("missing").unwrap_err();
    assert!(matches!(err, OcflError::NotFound(_)), "got: {}", err);

    Ok(())
}

#[test]
fn rollback_discards_the_mutable_head() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let src = temp.path().join("src");
    write_tree(&src, &[("a.txt", "base\n")])?;
    repo.put_object("o1", &src, VersionInfo::new())?;

    let b = temp.path().join("b.txt");
    fs::write(&b, "staged\n")?;
    repo.stage_changes("o1", VersionInfo::new(), |updater| {
        updater.add_file(&b, "b.txt", false)
    })?;

    repo.rollback_to_version("o1", VersionNum::new(1))?;

    assert!(!repo.has_staged_changes("o1")?);
    assert_eq!(
        VersionNum::new(1),
        repo.describe_object("o1")?.version_details.version_num
    );

    let object_root = repo_root(&temp).join(&repo.describe_object("o1")?.object_root);
    assert!(!object_root.join("extensions/0005-mutable-head").exists());

    Ok(())
}

#[test]
fn staged_objects_cannot_be_imported() -> Result<()> {
    let temp = TempDir::new()?;
    let repo = init_repo(&temp)?;

    let src = temp.path().join("src");
    write_tree(&src, &[("a.txt", "base\n")])?;
    repo.put_object("o1", &src, VersionInfo::new())?;

    let b = temp.path().join("b.txt");
    fs::write(&b, "staged\n")?;
    repo.stage_changes("o1", VersionInfo::new(), |updater| {
        updater.add_file(&b, "b.txt", false)
    })?;

    let export = temp.path().join("export");
    repo.export_object("o1", &export)?;

    let second = TempDir::new()?;
    let repo2 = init_repo(&second)?;

    let err = repo2.import_object(&export).unwrap_err();
    assert!(matches!(err, OcflError::IllegalState(_)), "got: {}", err);

    Ok(())
}
