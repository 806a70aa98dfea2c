mod common;

use anyhow::Result;

use crm_authz::errors::AppError;
use crm_authz::models::department::DepartmentUpdateRequest;
use crm_authz::stores::DepartmentStore;

use common::{create_department, deactivate_user, insert_user, setup};

fn move_under(parent_id: Option<i64>) -> DepartmentUpdateRequest {
    DepartmentUpdateRequest {
        parent_id: Some(parent_id),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_derives_path_and_level_from_parent() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let store = DepartmentStore::new(pool.clone());

    let root = create_department(&pool, "HQ", None).await?;
    let sales = create_department(&pool, "Sales", Some(root)).await?;
    let east = create_department(&pool, "Sales East", Some(sales)).await?;

    let root_dept = store.get(root).await?;
    assert_eq!(root_dept.path, root.to_string());
    assert_eq!(root_dept.level, 1);

    let east_dept = store.get(east).await?;
    assert_eq!(east_dept.path, format!("{root}/{sales}/{east}"));
    assert_eq!(east_dept.level, 3);

    let chain: Vec<i64> = store.ancestor_chain(east).await?.into_iter().map(|d| d.id).collect();
    assert_eq!(chain, vec![root, sales]);

    assert_eq!(store.descendant_ids(root).await?, vec![sales, east]);

    Ok(())
}

#[tokio::test]
async fn create_under_missing_parent_is_not_found() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let err = create_department(&pool, "Orphan", Some(404)).await.unwrap_err();

    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn reparent_repairs_every_descendant() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let store = DepartmentStore::new(pool.clone());

    let hq = create_department(&pool, "HQ", None).await?;
    let branch = create_department(&pool, "Branch", None).await?;
    let sales = create_department(&pool, "Sales", Some(hq)).await?;
    let east = create_department(&pool, "East", Some(sales)).await?;
    let boston = create_department(&pool, "Boston", Some(east)).await?;

    let moved = store.update(sales, &move_under(Some(branch))).await?;
    assert_eq!(moved.path, format!("{branch}/{sales}"));
    assert_eq!(moved.level, 2);

    for (id, parent) in [(east, sales), (boston, east)] {
        let child = store.get(id).await?;
        let parent = store.get(parent).await?;
        assert_eq!(child.path, format!("{}/{}", parent.path, id));
        assert_eq!(child.level, parent.level + 1);
    }
    assert_eq!(store.get(boston).await?.path, format!("{branch}/{sales}/{east}/{boston}"));

    // and back to the root
    store.update(sales, &move_under(None)).await?;
    assert_eq!(store.get(boston).await?.path, format!("{sales}/{east}/{boston}"));
    assert_eq!(store.get(boston).await?.level, 3);
    assert!(store.descendant_ids(hq).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn reparent_under_self_or_descendant_is_rejected() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let store = DepartmentStore::new(pool.clone());

    let sales = create_department(&pool, "Sales", None).await?;
    let east = create_department(&pool, "East", Some(sales)).await?;
    let boston = create_department(&pool, "Boston", Some(east)).await?;

    let err = store.update(sales, &move_under(Some(sales))).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = store.update(sales, &move_under(Some(boston))).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let unchanged = store.get(sales).await?;
    assert_eq!(unchanged.parent_id, None);
    assert_eq!(unchanged.path, sales.to_string());
    assert_eq!(store.get(boston).await?.path, format!("{sales}/{east}/{boston}"));

    Ok(())
}

#[tokio::test]
async fn rename_keeps_placement() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let store = DepartmentStore::new(pool.clone());

    let hq = create_department(&pool, "HQ", None).await?;
    let sales = create_department(&pool, "Sales", Some(hq)).await?;

    let renamed = store
        .update(
            sales,
            &DepartmentUpdateRequest {
                name: Some("Revenue".into()),
                ..Default::default()
            },
        )
        .await?;

    assert_eq!(renamed.name, "Revenue");
    assert_eq!(renamed.parent_id, Some(hq));
    assert_eq!(renamed.path, format!("{hq}/{sales}"));

    Ok(())
}

#[tokio::test]
async fn delete_is_guarded_by_children_then_members() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let store = DepartmentStore::new(pool.clone());

    let sales = create_department(&pool, "Sales", None).await?;
    let east = create_department(&pool, "East", Some(sales)).await?;
    let carol = insert_user(&pool, "carol", "user", Some(east)).await?;

    let err = store.delete(sales).await.unwrap_err();
    assert!(matches!(err, AppError::HasChildren(_)));
    assert!(store.get(sales).await.is_ok());

    let err = store.delete(east).await.unwrap_err();
    assert!(matches!(err, AppError::HasMembers(_)));
    assert!(store.get(east).await.is_ok());

    deactivate_user(&pool, carol).await?;
    store.delete(east).await?;
    assert!(matches!(store.get(east).await, Err(AppError::NotFound(_))));

    let department_id: Option<i64> = sqlx::query_scalar("SELECT department_id FROM users WHERE id = ?")
        .bind(carol)
        .fetch_one(&pool)
        .await?;
    assert_eq!(department_id, None);

    store.delete(sales).await?;
    assert!(matches!(store.delete(sales).await, Err(AppError::NotFound(_))));

    Ok(())
}

#[tokio::test]
async fn members_can_include_sub_departments() -> Result<()> {
    let (_dir, pool) = setup().await?;
    let store = DepartmentStore::new(pool.clone());

    let sales = create_department(&pool, "Sales", None).await?;
    let east = create_department(&pool, "East", Some(sales)).await?;
    insert_user(&pool, "dave", "admin", Some(sales)).await?;
    insert_user(&pool, "erin", "user", Some(east)).await?;
    let gone = insert_user(&pool, "frank", "user", Some(east)).await?;
    deactivate_user(&pool, gone).await?;

    let direct: Vec<String> = store.members(sales, false).await?.into_iter().map(|m| m.username).collect();
    assert_eq!(direct, vec!["dave"]);

    let all: Vec<String> = store.members(sales, true).await?.into_iter().map(|m| m.username).collect();
    assert_eq!(all, vec!["dave", "erin"]);

    let tree = store.tree().await?;
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].member_count, 1);
    assert_eq!(tree[0].children[0].id, east);
    assert_eq!(tree[0].children[0].member_count, 1);

    Ok(())
}
