use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "t_user_profile")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: i32,
    pub name: String,
    pub bio: Option<String>,
    pub facebook_username: Option<String>,
    pub is_facebook_visible: bool,
    pub twitter_username: Option<String>,
    pub is_twitter_visible: bool,
    pub website: Option<String>,
    pub updated: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
