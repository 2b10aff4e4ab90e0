use sea_orm::entity::prelude::*;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    #[sea_orm(num_value = 0)]
    New,
    #[sea_orm(num_value = 1)]
    Activated,
    #[sea_orm(num_value = 2)]
    Deactivated,
    #[sea_orm(num_value = 3)]
    Deleted,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "t_user")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub username: Option<String>,
    pub password_hash: String,
    pub status: UserStatus,
    pub created: Option<DateTimeUtc>,
    pub updated: Option<DateTimeUtc>,
    pub last_acted: Option<DateTimeUtc>,
}

impl Model {
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| format!("user#{}", self.id))
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
