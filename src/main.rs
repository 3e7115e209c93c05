#[rocket::launch]
fn rocket() -> _ {
    audience_server::rocket()
}
